//! mosquitto-lua Configuration System
//!
//! Provides configuration management for the mosquitto Lua bindings:
//! - Global user configuration (~/.mosquitto-lua/config.toml)
//! - Project configuration (mosquitto-lua.toml)
//! - Environment overrides (MOSQUITTO_LUA_*)
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.mosquitto-lua/config.toml)
//! 2. Project config (./mosquitto-lua.toml, searched upwards)
//! 3. Environment variables (MOSQUITTO_LUA_*)
//! 4. Explicit arguments passed by scripts (handled by caller)
//!
//! # Example
//!
//! ```no_run
//! use mosquitto_lua_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! let settings = config.settings();
//! assert!(settings.port > 0);
//! ```

pub mod loader;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// File name of the project-level configuration
pub const PROJECT_CONFIG_FILE: &str = "mosquitto-lua.toml";

pub use loader::{Config, ConfigLoader};
pub use settings::{
    BridgeConfig, ConnectConfig, EngineConfig, LoggingConfig, LoopConfig, Settings,
};
