//! Handler invocation that never lets a failure escape into the engine.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::event::{EventKind, HostArg};
use crate::host::HostRuntime;

/// What happened to a single handler call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Completed,
    /// The handler raised an error; the message was logged and discarded.
    Failed(String),
    /// The handler (or runtime) panicked; the panic was contained.
    Panicked(String),
}

/// Runs handlers in protected mode.
pub struct GuardedCallInvoker {
    report_failures: AtomicBool,
}

impl GuardedCallInvoker {
    pub fn new(report_failures: bool) -> Self {
        Self {
            report_failures: AtomicBool::new(report_failures),
        }
    }

    pub fn set_report_failures(&self, report: bool) {
        self.report_failures.store(report, Ordering::Relaxed);
    }

    pub fn reports_failures(&self) -> bool {
        self.report_failures.load(Ordering::Relaxed)
    }

    pub fn invoke<H: HostRuntime>(
        &self,
        host: &H,
        kind: EventKind,
        handler: &H::Handler,
        args: &[HostArg],
    ) -> Invocation {
        match panic::catch_unwind(AssertUnwindSafe(|| host.invoke(handler, args))) {
            Ok(Ok(())) => Invocation::Completed,
            Ok(Err(err)) => {
                if self.reports_failures() {
                    tracing::warn!(event = %kind, error = %err, "handler failed");
                }
                Invocation::Failed(err.0)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(event = %kind, panic = %message, "handler panicked");
                Invocation::Panicked(message)
            }
        }
    }
}

impl Default for GuardedCallInvoker {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Run `f`, swallowing any panic. Used at `extern "C"` entry points.
pub fn contain<R>(label: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            tracing::error!(site = label, panic = %panic_message(payload.as_ref()), "panic contained");
            None
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;

    #[derive(Clone)]
    struct FnHost;

    enum Behaviour {
        Ok,
        Fail,
        Panic,
    }

    impl HostRuntime for FnHost {
        type Handler = Behaviour;

        fn invoke(&self, handler: &Behaviour, _args: &[HostArg]) -> Result<(), HostError> {
            match handler {
                Behaviour::Ok => Ok(()),
                Behaviour::Fail => Err(HostError("attempt to index a nil value".to_string())),
                Behaviour::Panic => panic!("boom"),
            }
        }
    }

    #[test]
    fn test_completed() {
        let invoker = GuardedCallInvoker::default();
        let outcome = invoker.invoke(&FnHost, EventKind::Log, &Behaviour::Ok, &[]);
        assert_eq!(outcome, Invocation::Completed);
    }

    #[test]
    fn test_failure_contained() {
        let invoker = GuardedCallInvoker::new(false);
        let outcome = invoker.invoke(&FnHost, EventKind::Message, &Behaviour::Fail, &[]);
        assert_eq!(
            outcome,
            Invocation::Failed("attempt to index a nil value".to_string())
        );
    }

    #[test]
    fn test_panic_contained() {
        let invoker = GuardedCallInvoker::default();
        let outcome = invoker.invoke(&FnHost, EventKind::Connect, &Behaviour::Panic, &[]);
        assert_eq!(outcome, Invocation::Panicked("boom".to_string()));
    }

    #[test]
    fn test_contain() {
        assert_eq!(contain("test", || 7), Some(7));
        assert_eq!(contain("test", || -> i32 { panic!("nope") }), None);
    }
}
