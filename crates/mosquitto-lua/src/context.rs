//! Client contexts: one engine handle, one handler registry, one session slot.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::bridge::{self, ContextId, Dispatch, EventSink, EventTarget};
use crate::driver::LoopDriver;
use crate::engine::{Engine, EngineLibrary, LibraryUse};
use crate::error::{BridgeError, Result};
use crate::event::{EngineEvent, EventKind};
use crate::guarded::GuardedCallInvoker;
use crate::host::HostRuntime;
use crate::reason::{translate_status, EngineError, StatusCode};
use crate::registry::HandlerRegistry;

/// How the engine is currently being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// On the calling thread, for the duration of one driving call.
    Foreground,
    /// On an engine-owned thread, until stopped.
    Background,
}

pub(crate) struct ActiveSession<H> {
    pub(crate) host: H,
    pub(crate) mode: DriveMode,
    /// The driving thread, for foreground sessions.
    pub(crate) thread: Option<ThreadId>,
}

/// Engine handle together with the library use that keeps it valid.
///
/// Field order matters: the handle is freed before the library is released.
pub(crate) struct EngineHandle {
    engine: Box<dyn Engine>,
    _library: LibraryUse,
}

impl Deref for EngineHandle {
    type Target = dyn Engine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

pub(crate) struct ContextShared<H: HostRuntime> {
    pub(crate) id: ContextId,
    engine: RwLock<Option<Arc<EngineHandle>>>,
    registry: HandlerRegistry<H::Handler>,
    session: Mutex<Option<ActiveSession<H>>>,
    /// Serialises handler invocations per context; reentrant so a handler that
    /// drives a nested dispatch on the same thread does not deadlock.
    dispatch: ReentrantMutex<()>,
    invoker: GuardedCallInvoker,
}

impl<H: HostRuntime> ContextShared<H> {
    pub(crate) fn engine(&self) -> Result<Arc<EngineHandle>> {
        self.engine.read().clone().ok_or(BridgeError::Destroyed)
    }

    /// Claim the session slot. Fails if any driving call is already active.
    pub(crate) fn begin_session(&self, host: H, mode: DriveMode) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(BridgeError::AlreadyDriving);
        }
        let thread = match mode {
            DriveMode::Foreground => Some(thread::current().id()),
            DriveMode::Background => None,
        };
        *session = Some(ActiveSession { host, mode, thread });
        Ok(())
    }

    pub(crate) fn end_session(&self) {
        let previous = self.session.lock().take();
        drop(previous);
    }

    pub(crate) fn session_mode(&self) -> Option<DriveMode> {
        self.session.lock().as_ref().map(|s| s.mode)
    }
}

impl<H: HostRuntime> EventTarget for ContextShared<H> {
    fn deliver(&self, event: EngineEvent) -> Dispatch {
        let kind = event.kind();

        let host = match self.session.lock().as_ref() {
            Some(session) => match session.thread {
                Some(driving) if driving != thread::current().id() => {
                    tracing::warn!(context = %self.id, event = %kind, "event raised off the driving thread dropped");
                    return Dispatch::OffThread;
                }
                _ => session.host.clone(),
            },
            None => {
                tracing::warn!(context = %self.id, event = %kind, "event outside a driving call dropped");
                return Dispatch::NoSession;
            }
        };

        let Some(handler) = self.registry.get(kind) else {
            tracing::trace!(context = %self.id, event = %kind, "no handler");
            return Dispatch::NoHandler;
        };

        let args = event.into_args();
        let _serial = self.dispatch.lock();
        tracing::trace!(context = %self.id, event = %kind, "dispatch");
        Dispatch::Invoked(self.invoker.invoke(&host, kind, &handler, &args))
    }
}

/// One client session bound to an engine handle.
///
/// Dropping the context destroys it.
pub struct ClientContext<H: HostRuntime> {
    shared: Arc<ContextShared<H>>,
}

fn validate_identity(client_id: Option<&str>, clean_session: bool) -> Result<()> {
    if client_id.is_none() && !clean_session {
        return Err(BridgeError::InvalidArgument(
            "if 'id' is nil then 'clean session' must be true".to_string(),
        ));
    }
    Ok(())
}

fn creation_error(err: EngineError) -> BridgeError {
    match (err.code, err.errno) {
        (StatusCode::Errno, Some(errno)) => {
            BridgeError::Os(std::io::Error::from_raw_os_error(errno))
        }
        _ => translate_status(err),
    }
}

impl<H: HostRuntime> ClientContext<H> {
    /// Create a context with a fresh engine handle and no handlers.
    pub fn create(library: &EngineLibrary, client_id: Option<&str>, clean_session: bool) -> Result<Self> {
        validate_identity(client_id, clean_session)?;

        let library_use = library.acquire()?;
        let id = ContextId::next();
        let engine = library
            .factory()
            .create(client_id, clean_session, EventSink::new(id))
            .map_err(creation_error)?;

        let shared = Arc::new(ContextShared {
            id,
            engine: RwLock::new(Some(Arc::new(EngineHandle {
                engine,
                _library: library_use,
            }))),
            registry: HandlerRegistry::new(),
            session: Mutex::new(None),
            dispatch: ReentrantMutex::new(()),
            invoker: GuardedCallInvoker::default(),
        });

        let weak = Arc::downgrade(&shared);
        let target: Weak<dyn EventTarget> = weak;
        bridge::register(id, target);

        tracing::debug!(context = %id, client_id = ?client_id, clean_session, "client created");
        Ok(Self { shared })
    }

    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.engine.read().is_none()
    }

    /// Whether a driving call (foreground or background) is active.
    pub fn is_driving(&self) -> bool {
        self.shared.session_mode().is_some()
    }

    pub fn drive_mode(&self) -> Option<DriveMode> {
        self.shared.session_mode()
    }

    pub fn set_report_handler_errors(&self, report: bool) {
        self.shared.invoker.set_report_failures(report);
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn set_handler(&self, kind: EventKind, handler: H::Handler) -> Result<()> {
        self.shared.engine()?;
        self.shared.registry.set(kind, handler);
        tracing::trace!(context = %self.shared.id, event = %kind, "handler set");
        Ok(())
    }

    pub fn handler(&self, kind: EventKind) -> Option<Arc<H::Handler>> {
        self.shared.registry.get(kind)
    }

    pub fn handler_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Drop every handler and rebind the engine handle.
    ///
    /// Not allowed while the context is being driven.
    pub fn reinitialise(&self, client_id: Option<&str>, clean_session: bool) -> Result<()> {
        validate_identity(client_id, clean_session)?;
        let engine = self.shared.engine()?;
        if self.is_driving() {
            return Err(BridgeError::AlreadyDriving);
        }

        self.shared.registry.clear_all();
        engine
            .reinitialise(client_id, clean_session, EventSink::new(self.shared.id))
            .map_err(translate_status)?;

        tracing::debug!(context = %self.shared.id, client_id = ?client_id, clean_session, "client reinitialised");
        Ok(())
    }

    /// Stop any background loop, release all handlers and free the engine handle.
    ///
    /// Every later operation fails with [`BridgeError::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        let handle = self
            .shared
            .engine
            .write()
            .take()
            .ok_or(BridgeError::Destroyed)?;
        bridge::unregister(self.shared.id);

        if self.shared.session_mode() == Some(DriveMode::Background) {
            if let Err(err) = handle.loop_stop(true) {
                tracing::warn!(context = %self.shared.id, error = %err, "background loop did not stop cleanly");
            }
            self.shared.end_session();
        }

        self.shared.registry.clear_all();
        drop(handle);

        tracing::debug!(context = %self.shared.id, "client destroyed");
        Ok(())
    }

    /// Driving operations for this context.
    pub fn driver(&self) -> LoopDriver<'_, H> {
        LoopDriver::new(&self.shared)
    }

    pub(crate) fn engine(&self) -> Result<Arc<EngineHandle>> {
        self.shared.engine()
    }
}

impl<H: HostRuntime> Drop for ClientContext<H> {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            let _ = self.destroy();
        }
    }
}

impl<H: HostRuntime> fmt::Debug for ClientContext<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("id", &self.shared.id)
            .field("destroyed", &self.is_destroyed())
            .field("mode", &self.shared.session_mode())
            .field("handlers", &self.shared.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedFactory;
    use crate::event::HostArg;
    use crate::host::HostError;

    #[derive(Clone, Default)]
    struct NullHost;

    impl HostRuntime for NullHost {
        type Handler = ();

        fn invoke(&self, _handler: &(), _args: &[HostArg]) -> std::result::Result<(), HostError> {
            Ok(())
        }
    }

    fn library() -> EngineLibrary {
        EngineLibrary::new(Arc::new(ScriptedFactory::new()))
    }

    #[test]
    fn test_anonymous_persistent_session_rejected() {
        let result = ClientContext::<NullHost>::create(&library(), None, false);
        assert!(matches!(result, Err(BridgeError::InvalidArgument(_))));
    }

    #[test]
    fn test_create_starts_empty() {
        let ctx = ClientContext::<NullHost>::create(&library(), Some("c1"), false).unwrap();
        assert_eq!(ctx.handler_count(), 0);
        assert!(!ctx.is_driving());
        assert!(!ctx.is_destroyed());
    }

    #[test]
    fn test_destroy_unregisters_and_releases_library() {
        let library = library();
        let ctx = ClientContext::<NullHost>::create(&library, None, true).unwrap();
        ctx.set_handler(EventKind::Log, ()).unwrap();
        assert_eq!(library.users(), 1);

        ctx.destroy().unwrap();
        assert_eq!(library.users(), 0);
        assert_eq!(ctx.handler_count(), 0);
        assert_eq!(
            bridge::raise(ctx.id(), EngineEvent::Publish { mid: 1 }),
            Dispatch::UnknownContext
        );
        assert!(matches!(ctx.destroy(), Err(BridgeError::Destroyed)));
        assert!(matches!(ctx.set_handler(EventKind::Log, ()), Err(BridgeError::Destroyed)));
    }

    #[test]
    fn test_drop_destroys() {
        let library = library();
        let id = {
            let ctx = ClientContext::<NullHost>::create(&library, None, true).unwrap();
            ctx.id()
        };
        assert_eq!(library.users(), 0);
        assert_eq!(
            bridge::raise(id, EngineEvent::Connect { rc: 0 }),
            Dispatch::UnknownContext
        );
    }

    #[test]
    fn test_reinitialise_clears_handlers() {
        let ctx = ClientContext::<NullHost>::create(&library(), Some("a"), true).unwrap();
        ctx.set_handler(EventKind::Message, ()).unwrap();
        ctx.set_handler(EventKind::Connect, ()).unwrap();

        ctx.reinitialise(Some("b"), false).unwrap();
        assert_eq!(ctx.handler_count(), 0);
        assert!(matches!(
            ctx.reinitialise(None, false),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_foreground_session_only_accepts_driving_thread() {
        let ctx = ClientContext::<NullHost>::create(&library(), None, true).unwrap();
        ctx.set_handler(EventKind::Publish, ()).unwrap();
        ctx.shared.begin_session(NullHost, DriveMode::Foreground).unwrap();

        let id = ctx.id();
        let elsewhere = std::thread::spawn(move || bridge::raise(id, EngineEvent::Publish { mid: 1 }))
            .join()
            .unwrap();
        assert_eq!(elsewhere, Dispatch::OffThread);
        assert!(matches!(
            bridge::raise(id, EngineEvent::Publish { mid: 2 }),
            Dispatch::Invoked(_)
        ));
        ctx.shared.end_session();
    }

    #[test]
    fn test_events_outside_session_dropped() {
        let ctx = ClientContext::<NullHost>::create(&library(), None, true).unwrap();
        ctx.set_handler(EventKind::Publish, ()).unwrap();
        assert_eq!(
            bridge::raise(ctx.id(), EngineEvent::Publish { mid: 2 }),
            Dispatch::NoSession
        );
    }
}
