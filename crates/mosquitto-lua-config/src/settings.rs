//! Configuration file schema
//!
//! The same schema is used for the global file and for project files; the
//! loader merges them section by section.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Log levels accepted in `[logging] level`
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Contents of one configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Engine library selection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,

    /// Defaults for `connect`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectConfig>,

    /// Defaults for the loop-driving calls
    #[serde(rename = "loop", skip_serializing_if = "Option::is_none")]
    pub driving: Option<LoopConfig>,

    /// Logging and handler-error reporting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// `[engine]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Library short name ("mosquitto") or absolute path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,

    /// Extra directories searched before the platform defaults
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,
}

/// `[connect]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ConnectConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,

    /// Keepalive interval in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<i64>,
}

/// `[loop]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoopConfig {
    /// Milliseconds to wait for traffic (-1 for the engine default)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_packets: Option<i64>,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Report failures raised by script handlers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_handler_errors: Option<bool>,
}

/// Fully resolved settings with defaults applied
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub library: String,
    pub search_paths: Vec<PathBuf>,
    pub host: String,
    pub port: u16,
    pub keepalive: i32,
    pub loop_timeout_ms: i32,
    pub max_packets: i32,
    pub log_level: String,
    pub report_handler_errors: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            library: "mosquitto".to_string(),
            search_paths: Vec::new(),
            host: "localhost".to_string(),
            port: 1883,
            keepalive: 60,
            loop_timeout_ms: -1,
            max_packets: 1,
            log_level: "warn".to_string(),
            report_handler_errors: true,
        }
    }
}

impl BridgeConfig {
    /// Load a configuration file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(connect) = &self.connect {
            if let Some(port) = connect.port {
                if !(1..=i64::from(u16::MAX)).contains(&port) {
                    return Err(invalid("connect.port", format!("{} is not a TCP port", port)));
                }
            }
            if let Some(keepalive) = connect.keepalive {
                if keepalive < 0 || keepalive > i64::from(i32::MAX) {
                    return Err(invalid(
                        "connect.keepalive",
                        format!("{} is out of range", keepalive),
                    ));
                }
            }
        }

        if let Some(driving) = &self.driving {
            if let Some(timeout) = driving.timeout_ms {
                if timeout < -1 || timeout > i64::from(i32::MAX) {
                    return Err(invalid("loop.timeout_ms", format!("{} is out of range", timeout)));
                }
            }
            if let Some(max_packets) = driving.max_packets {
                if max_packets < 1 || max_packets > i64::from(i32::MAX) {
                    return Err(invalid(
                        "loop.max_packets",
                        "must be at least 1".to_string(),
                    ));
                }
            }
        }

        if let Some(logging) = &self.logging {
            if let Some(level) = &logging.level {
                validate_log_level("logging.level", level)?;
            }
        }

        if let Some(engine) = &self.engine {
            if let Some(library) = &engine.library {
                if library.trim().is_empty() {
                    return Err(invalid("engine.library", "must not be empty".to_string()));
                }
            }
        }

        Ok(())
    }

    /// Overlay `other` on top of `self`, field by field
    pub fn merge(mut self, other: BridgeConfig) -> BridgeConfig {
        if let Some(engine) = other.engine {
            let base = self.engine.get_or_insert_with(Default::default);
            if engine.library.is_some() {
                base.library = engine.library;
            }
            let mut paths = engine.search_paths;
            paths.append(&mut base.search_paths);
            base.search_paths = paths;
        }

        if let Some(connect) = other.connect {
            let base = self.connect.get_or_insert_with(Default::default);
            base.host = connect.host.or(base.host.take());
            base.port = connect.port.or(base.port);
            base.keepalive = connect.keepalive.or(base.keepalive);
        }

        if let Some(driving) = other.driving {
            let base = self.driving.get_or_insert_with(Default::default);
            base.timeout_ms = driving.timeout_ms.or(base.timeout_ms);
            base.max_packets = driving.max_packets.or(base.max_packets);
        }

        if let Some(logging) = other.logging {
            let base = self.logging.get_or_insert_with(Default::default);
            base.level = logging.level.or(base.level.take());
            base.report_handler_errors = logging
                .report_handler_errors
                .or(base.report_handler_errors);
        }

        self
    }

    /// Resolve into concrete settings, falling back to defaults
    pub fn resolve(&self) -> Settings {
        let mut settings = Settings::default();

        if let Some(engine) = &self.engine {
            if let Some(library) = &engine.library {
                settings.library = library.clone();
            }
            settings.search_paths = engine.search_paths.clone();
        }

        if let Some(connect) = &self.connect {
            if let Some(host) = &connect.host {
                settings.host = host.clone();
            }
            if let Some(port) = connect.port.and_then(|p| u16::try_from(p).ok()) {
                settings.port = port;
            }
            if let Some(keepalive) = connect.keepalive.and_then(|k| i32::try_from(k).ok()) {
                settings.keepalive = keepalive;
            }
        }

        if let Some(driving) = &self.driving {
            if let Some(timeout) = driving.timeout_ms.and_then(|t| i32::try_from(t).ok()) {
                settings.loop_timeout_ms = timeout;
            }
            if let Some(max) = driving.max_packets.and_then(|m| i32::try_from(m).ok()) {
                settings.max_packets = max;
            }
        }

        if let Some(logging) = &self.logging {
            if let Some(level) = &logging.level {
                settings.log_level = level.to_lowercase();
            }
            if let Some(report) = logging.report_handler_errors {
                settings.report_handler_errors = report;
            }
        }

        settings
    }
}

/// Check a log level name
pub(crate) fn validate_log_level(field: &str, level: &str) -> ConfigResult<()> {
    if LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(invalid(
            field,
            format!("'{}' is not one of {}", level, LOG_LEVELS.join(", ")),
        ))
    }
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason,
    }
}
