//! The seam between the bridge and a scripting runtime.

use thiserror::Error;

use crate::event::HostArg;

/// A failure reported by a handler while it ran.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HostError(pub String);

/// A script runtime that can run registered handlers.
///
/// The handle is cloned into the context for the duration of a driving call, so
/// events raised on the driving thread run against the runtime that is driving.
/// Implementations used with a background loop must be callable from any thread.
pub trait HostRuntime: Clone + Send + Sync + 'static {
    /// Runtime-owned reference to a handler callable.
    type Handler: Send + Sync + 'static;

    /// Run `handler` with positional `args`. Return values are ignored.
    fn invoke(&self, handler: &Self::Handler, args: &[HostArg]) -> Result<(), HostError>;
}
