//! Tracing subscriber setup.
//!
//! The level comes from `RUST_LOG` when set, otherwise from
//! `[logging] level`. Python-style names (`WARNING`, `CRITICAL`) are
//! accepted and mapped onto tracing levels. Initialization is idempotent:
//! a second call (for example from tests) is a no-op.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Map a configured level name onto a tracing filter directive.
pub fn filter_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}

pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(&config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    // Logs go to stderr so command output on stdout stays machine-readable.
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive("WARNING"), "warn");
        assert_eq!(filter_directive("CRITICAL"), "error");
        assert_eq!(filter_directive("Debug"), "debug");
        assert_eq!(filter_directive("whatever"), "info");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        init(&config);
        init(&config);
    }
}
