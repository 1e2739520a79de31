//! mosquitto-lua - MQTT client bindings for Lua
//!
//! This library exposes libmosquitto client sessions to Lua scripts:
//! - Client contexts owning one engine handle each
//! - Per-event handler registries
//! - A callback bridge that runs script handlers in protected mode
//! - Loop driving in the foreground or on an engine thread
//!
//! The bridge itself is host-agnostic ([`HostRuntime`]); [`lua`] binds it to
//! mlua.

/// mosquitto-lua version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bridge;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod event;
pub mod guarded;
pub mod host;
pub mod logging;
pub mod lua;
pub mod operations;
pub mod reason;
pub mod registry;

// Re-export commonly used types
pub use bridge::{ContextId, Dispatch, EventSink};
pub use context::{ClientContext, DriveMode};
pub use driver::LoopDriver;
pub use engine::{Engine, EngineFactory, EngineLibrary, LibraryUse, ProtocolVersion, TlsFiles};
pub use error::{BridgeError, Result};
pub use event::{EngineEvent, EventKind, HostArg};
pub use guarded::{GuardedCallInvoker, Invocation};
pub use host::{HostError, HostRuntime};
pub use reason::{translate_connect, translate_disconnect, ConnectReasonCode, Outcome, StatusCode};
pub use registry::HandlerRegistry;
