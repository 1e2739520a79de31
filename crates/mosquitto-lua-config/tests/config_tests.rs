//! Configuration loading and precedence tests

use mosquitto_lua_config::loader::{ENV_LIBRARY, ENV_LOG};
use mosquitto_lua_config::{ConfigError, ConfigLoader, Settings, PROJECT_CONFIG_FILE};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

// ============================================================================
// Loading
// ============================================================================

#[test]
#[serial]
fn test_no_config_anywhere_gives_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let mut loader = ConfigLoader::with_global_path(temp_dir.path().join("missing.toml"));

    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert!(!config.is_project());
    assert_eq!(config.settings(), Settings::default());
}

#[test]
#[serial]
fn test_project_overrides_global() {
    let temp_dir = TempDir::new().unwrap();
    let global = write_file(
        temp_dir.path(),
        "global.toml",
        "[connect]\nhost = \"global-broker\"\nkeepalive = 120\n\n[logging]\nlevel = \"info\"\n",
    );
    let project_dir = temp_dir.path().join("project");
    fs::create_dir(&project_dir).unwrap();
    write_file(
        &project_dir,
        PROJECT_CONFIG_FILE,
        "[connect]\nhost = \"project-broker\"\n",
    );

    let config = ConfigLoader::with_global_path(global)
        .load_from_directory(&project_dir)
        .unwrap();
    let settings = config.settings();

    assert_eq!(settings.host, "project-broker");
    assert_eq!(settings.keepalive, 120);
    assert_eq!(settings.log_level, "info");
}

#[test]
#[serial]
fn test_load_from_specific_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_file(temp_dir.path(), "custom.toml", "[loop]\nmax_packets = 8\n");

    let config = ConfigLoader::with_global_path(temp_dir.path().join("missing.toml"))
        .load_from_file(&path)
        .unwrap();

    assert_eq!(config.settings().max_packets, 8);
    assert_eq!(config.project_root(), Some(temp_dir.path()));
}

#[test]
fn test_missing_specific_file() {
    let temp_dir = TempDir::new().unwrap();
    let result = ConfigLoader::with_global_path(temp_dir.path().join("missing.toml"))
        .load_from_file(&temp_dir.path().join("nope.toml"));

    assert!(matches!(result, Err(ConfigError::NotFound(_))));
}

#[test]
#[serial]
fn test_syntax_error_reports_file() {
    let temp_dir = TempDir::new().unwrap();
    write_file(temp_dir.path(), PROJECT_CONFIG_FILE, "[connect\nhost = 1\n");

    let result = ConfigLoader::with_global_path(temp_dir.path().join("missing.toml"))
        .load_from_directory(temp_dir.path());

    match result {
        Err(ConfigError::TomlParseError { file, .. }) => {
            assert!(file.ends_with(PROJECT_CONFIG_FILE));
        }
        other => panic!("expected parse error, got {:?}", other),
    }
}

// ============================================================================
// Validation
// ============================================================================

#[rstest]
#[case("[connect]\nport = 0\n", "connect.port")]
#[case("[connect]\nkeepalive = -5\n", "connect.keepalive")]
#[case("[loop]\ntimeout_ms = -2\n", "loop.timeout_ms")]
#[case("[loop]\nmax_packets = 0\n", "loop.max_packets")]
#[case("[logging]\nlevel = \"verbose\"\n", "logging.level")]
#[case("[engine]\nlibrary = \"  \"\n", "engine.library")]
#[serial]
fn test_invalid_values_rejected(#[case] content: &str, #[case] expected_field: &str) {
    let temp_dir = TempDir::new().unwrap();
    write_file(temp_dir.path(), PROJECT_CONFIG_FILE, content);

    let result = ConfigLoader::with_global_path(temp_dir.path().join("missing.toml"))
        .load_from_directory(temp_dir.path());

    match result {
        Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, expected_field),
        other => panic!("expected invalid value, got {:?}", other),
    }
}

// ============================================================================
// Environment overrides
// ============================================================================

#[test]
#[serial]
fn test_env_library_override() {
    let temp_dir = TempDir::new().unwrap();
    write_file(
        temp_dir.path(),
        PROJECT_CONFIG_FILE,
        "[engine]\nlibrary = \"mosquitto\"\n",
    );

    env::set_var(ENV_LIBRARY, "/usr/lib/libmosquitto.so.1");
    let config = ConfigLoader::with_global_path(temp_dir.path().join("missing.toml"))
        .load_from_directory(temp_dir.path());
    env::remove_var(ENV_LIBRARY);

    assert_eq!(
        config.unwrap().settings().library,
        "/usr/lib/libmosquitto.so.1"
    );
}

#[test]
#[serial]
fn test_env_log_level_validated() {
    let temp_dir = TempDir::new().unwrap();

    env::set_var(ENV_LOG, "chatty");
    let result = ConfigLoader::with_global_path(temp_dir.path().join("missing.toml"))
        .load_from_directory(temp_dir.path());
    env::remove_var(ENV_LOG);

    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}
