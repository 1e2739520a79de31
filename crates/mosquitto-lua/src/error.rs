//! Error types for the bridge.
//!
//! Errors are split along the line scripts care about: recoverable failures
//! are handed back as values, everything else aborts the current script call.

use thiserror::Error;

use crate::engine::loader::LoadError;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Transient engine condition (no connection, connection lost, oversized
    /// payload, errno-class failure). Returned to scripts as `nil, code, description`.
    #[error("{description}")]
    Recoverable { code: i32, description: String },

    /// Engine status that indicates misuse (invalid argument, out of memory,
    /// protocol violation, unsupported feature).
    #[error("{description}")]
    Engine { code: i32, description: String },

    /// Argument rejected before reaching the engine.
    #[error("bad argument: {0}")]
    InvalidArgument(String),

    /// Operation on a context after `destroy`.
    #[error("attempt to use a destroyed mosquitto client")]
    Destroyed,

    /// A driving call is already in progress for this context.
    #[error("client loop is already running")]
    AlreadyDriving,

    /// `stop_background` without a background loop.
    #[error("no background loop is running for this client")]
    NotDriving,

    /// The engine library could not be loaded or initialised.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error(transparent)]
    Library(#[from] LoadError),

    /// Engine handle creation failed at the OS level.
    #[error("{0}")]
    Os(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] mosquitto_lua_config::ConfigError),
}

impl BridgeError {
    /// Whether scripts receive this error as a value rather than a raised error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BridgeError::Recoverable { .. })
    }

    /// Engine or OS code attached to the error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            BridgeError::Recoverable { code, .. } | BridgeError::Engine { code, .. } => Some(*code),
            BridgeError::Os(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
