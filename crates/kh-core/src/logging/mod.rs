//! Structured logging for kill-hogs.
//!
//! Provides dual-mode logging:
//! - Human-readable console output for interactive use
//! - JSON lines for cron and log shippers
//!
//! stdout is reserved for command payloads (`check-config`); every log line
//! goes to stderr.

pub mod config;
pub mod events;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, Stage};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter: our crates and event targets at `level`, everything else at warn.
pub fn default_filter_directives(level: LogLevel) -> String {
    let mut directives = vec![
        "warn".to_string(),
        format!("kh_core={level}"),
        format!("kh_config={level}"),
    ];
    directives.extend(
        event_names::TARGET_PREFIXES
            .iter()
            .map(|prefix| format!("{prefix}={level}")),
    );
    directives.join(",")
}

/// Filter for `config`: its `RUST_LOG` directives when they decide the
/// level and parse, otherwise the defaults at `config.level`.
pub fn build_filter(config: &LogConfig) -> EnvFilter {
    config
        .directives
        .as_deref()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter_directives(config.level)))
}

/// Initialize the logging subsystem.
///
/// Must be called once at startup before any logging occurs.
pub fn init_logging(config: &LogConfig) {
    let filter = build_filter(config);

    match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_ansi(use_ansi);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
        }
        LogFormat::Jsonl => {
            let json_layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .flatten_event(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .init();
        }
    }
}

/// Generate a unique run ID for this invocation.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    // Shorten to first 12 hex chars for readability
    format!("run-{}", &uuid.simple().to_string()[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id() {
        let id1 = generate_run_id();
        let id2 = generate_run_id();

        assert!(id1.starts_with("run-"));
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 16);
        assert!(id1[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_default_filter_parses() {
        let directives = default_filter_directives(LogLevel::Debug);
        assert!(directives.starts_with("warn,kh_core=debug"));
        assert!(directives.contains("scan=debug"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn test_explicit_level_ignores_rust_log() {
        let quiet = LogConfig {
            level: LogLevel::Error,
            ..LogConfig::default()
        };
        let filter = build_filter(&quiet).to_string();
        assert!(filter.contains("kh_core=error"), "{filter}");
        assert!(!filter.contains("trace"), "{filter}");

        let from_rust_log = LogConfig {
            directives: Some("kh_core=trace".to_string()),
            ..LogConfig::default()
        };
        assert_eq!(build_filter(&from_rust_log).to_string(), "kh_core=trace");
    }

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Human);
        assert_eq!(config.level, LogLevel::Info);
        assert!(config.directives.is_none());
    }
}
