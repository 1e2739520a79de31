//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::settings::{validate_log_level, BridgeConfig, Settings};
use crate::{ConfigError, ConfigResult, PROJECT_CONFIG_FILE};
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable overriding `[engine] library`
pub const ENV_LIBRARY: &str = "MOSQUITTO_LUA_LIBRARY";
/// Environment variable overriding `[connect] host`
pub const ENV_HOST: &str = "MOSQUITTO_LUA_HOST";
/// Environment variable overriding `[connect] port`
pub const ENV_PORT: &str = "MOSQUITTO_LUA_PORT";
/// Environment variable overriding `[logging] level`
pub const ENV_LOG: &str = "MOSQUITTO_LUA_LOG";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.mosquitto-lua/config.toml) - lowest priority
/// 2. Project config (mosquitto-lua.toml) - overrides global
/// 3. Environment variables (MOSQUITTO_LUA_*) - overrides project
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Global configuration
    pub global: BridgeConfig,

    /// Project configuration, with environment overrides applied
    pub project: BridgeConfig,

    /// Directory where mosquitto-lua.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use an explicit global config file instead of the one in the home directory
    pub fn with_global_path(path: impl Into<PathBuf>) -> Self {
        Self {
            global_config_path: Some(path.into()),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find mosquitto-lua.toml, then loads and merges
    /// global config if it exists.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        let global_config = self.load_global_config()?;
        let project_config = self.apply_env_overrides(project_config)?;

        Ok(Config {
            global: global_config,
            project: project_config,
            project_root,
        })
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = BridgeConfig::load_from_file(config_path)?;
        let global_config = self.load_global_config()?;
        let project_config = self.apply_env_overrides(project_config)?;

        Ok(Config {
            global: global_config,
            project: project_config,
            project_root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, BridgeConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project_config = BridgeConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, BridgeConfig::default())),
            }
        }
    }

    /// Load global configuration; a missing file or home directory yields defaults
    fn load_global_config(&mut self) -> ConfigResult<BridgeConfig> {
        if self.global_config_path.is_none() {
            match Self::global_config_dir() {
                Ok(dir) => self.global_config_path = Some(dir.join("config.toml")),
                Err(ConfigError::HomeNotFound) => return Ok(BridgeConfig::default()),
                Err(e) => return Err(e),
            }
        }

        match &self.global_config_path {
            Some(path) if path.exists() => BridgeConfig::load_from_file(path),
            _ => Ok(BridgeConfig::default()),
        }
    }

    /// Apply MOSQUITTO_LUA_* environment overrides to the project config
    fn apply_env_overrides(&self, mut config: BridgeConfig) -> ConfigResult<BridgeConfig> {
        if let Ok(library) = env::var(ENV_LIBRARY) {
            config.engine.get_or_insert_with(Default::default).library = Some(library);
        }

        if let Ok(host) = env::var(ENV_HOST) {
            config.connect.get_or_insert_with(Default::default).host = Some(host);
        }

        if let Ok(port) = env::var(ENV_PORT) {
            let parsed = port
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: ENV_PORT.to_string(),
                    reason: format!("'{}' is not a TCP port", port),
                })?;
            config.connect.get_or_insert_with(Default::default).port = Some(i64::from(parsed));
        }

        if let Ok(level) = env::var(ENV_LOG) {
            validate_log_level(ENV_LOG, &level)?;
            config.logging.get_or_insert_with(Default::default).level = Some(level);
        }

        Ok(config)
    }

    /// Get the global configuration directory (~/.mosquitto-lua)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".mosquitto-lua"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Resolved settings (project over global over defaults)
    pub fn settings(&self) -> Settings {
        self.global.clone().merge(self.project.clone()).resolve()
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if a project file was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}
