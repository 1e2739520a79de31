//! Diagnostic output for the bindings.
//!
//! Installs a stderr `tracing` subscriber unless the embedding process already
//! has one. `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub fn default_filter(level: &str) -> EnvFilter {
    let directive = match level {
        "off" | "error" | "warn" | "info" | "debug" | "trace" => level,
        _ => "warn",
    };
    EnvFilter::new(format!("mosquitto_lua={}", directive))
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_level_falls_back_to_warn() {
        assert_eq!(default_filter("loud").to_string(), "mosquitto_lua=warn");
        assert_eq!(default_filter("debug").to_string(), "mosquitto_lua=debug");
    }

    #[test]
    fn test_second_init_is_harmless() {
        init("info");
        assert!(!init("debug"));
    }
}
