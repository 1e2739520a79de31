//! Routing of engine events back to their owning context.
//!
//! The engine only ever sees an opaque [`ContextId`]. Every raise goes through a
//! process-wide table of weak references, so an event that arrives for a context
//! that has been destroyed (or is being torn down) finds nothing and is dropped.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Weak};

use parking_lot::RwLock;

use crate::event::EngineEvent;
use crate::guarded::Invocation;

/// Identity of a client context, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ContextId {
    pub(crate) fn next() -> Self {
        ContextId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Outcome of a single raise. Callers are free to ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Invoked(Invocation),
    /// No handler registered for the event kind.
    NoHandler,
    /// Raised outside a driving call; there is no runtime to run the handler on.
    NoSession,
    /// Raised on a thread other than the one running a foreground driving call.
    OffThread,
    /// The context no longer exists.
    UnknownContext,
}

/// Something that can receive events by id.
pub(crate) trait EventTarget: Send + Sync {
    fn deliver(&self, event: EngineEvent) -> Dispatch;
}

static CONTEXTS: LazyLock<RwLock<HashMap<ContextId, Weak<dyn EventTarget>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

pub(crate) fn register(id: ContextId, target: Weak<dyn EventTarget>) {
    CONTEXTS.write().insert(id, target);
}

pub(crate) fn unregister(id: ContextId) {
    CONTEXTS.write().remove(&id);
}

/// Number of live registrations.
pub fn registered_contexts() -> usize {
    CONTEXTS.read().len()
}

/// Deliver `event` to the context identified by `id`.
pub fn raise(id: ContextId, event: EngineEvent) -> Dispatch {
    // Upgrade under the read lock, deliver after releasing it: handlers may
    // create or destroy contexts.
    let target = CONTEXTS.read().get(&id).and_then(Weak::upgrade);
    match target {
        Some(target) => target.deliver(event),
        None => {
            tracing::debug!(context = %id, event = %event.kind(), "event for unknown context dropped");
            Dispatch::UnknownContext
        }
    }
}

/// Handle given to an engine so it can report events for one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSink {
    id: ContextId,
}

impl EventSink {
    pub fn new(id: ContextId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn raise(&self, event: EngineEvent) -> Dispatch {
        raise(self.id, event)
    }

    /// Encode as the user-data word passed through C callbacks.
    ///
    /// The word is a number, never dereferenced.
    pub fn as_user_data(&self) -> *mut c_void {
        self.id.0 as usize as *mut c_void
    }

    pub fn from_user_data(obj: *mut c_void) -> Self {
        Self {
            id: ContextId(obj as usize as u64),
        }
    }
}

/// Keeps a registration alive while a test target is in scope.
#[cfg(test)]
pub(crate) fn register_arc(id: ContextId, target: &std::sync::Arc<dyn EventTarget>) {
    register(id, std::sync::Arc::downgrade(target));
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Collect(Mutex<Vec<EngineEvent>>);

    impl EventTarget for Collect {
        fn deliver(&self, event: EngineEvent) -> Dispatch {
            self.0.lock().push(event);
            Dispatch::Invoked(Invocation::Completed)
        }
    }

    #[test]
    fn test_raise_reaches_target() {
        let id = ContextId::next();
        let target: Arc<dyn EventTarget> = Arc::new(Collect(Mutex::new(Vec::new())));
        register_arc(id, &target);

        let outcome = raise(id, EngineEvent::Publish { mid: 3 });
        assert_eq!(outcome, Dispatch::Invoked(Invocation::Completed));
        unregister(id);
    }

    #[test]
    fn test_dropped_target_is_unknown() {
        let id = ContextId::next();
        {
            let target: Arc<dyn EventTarget> = Arc::new(Collect(Mutex::new(Vec::new())));
            register_arc(id, &target);
        }
        assert_eq!(raise(id, EngineEvent::Publish { mid: 1 }), Dispatch::UnknownContext);
        unregister(id);
    }

    #[test]
    fn test_unregistered_is_unknown() {
        let id = ContextId::next();
        assert_eq!(
            EventSink::new(id).raise(EngineEvent::Connect { rc: 0 }),
            Dispatch::UnknownContext
        );
    }

    #[test]
    fn test_user_data_encoding() {
        let sink = EventSink::new(ContextId::next());
        assert_eq!(EventSink::from_user_data(sink.as_user_data()), sink);
    }
}
