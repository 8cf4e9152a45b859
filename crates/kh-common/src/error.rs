//! Error types for kill-hogs.
//!
//! Errors fall into three operational classes:
//! - Transient per-process failures (a process exited mid-measurement).
//!   These never abort a run.
//! - Collaborator failures (GPU tool missing, mail relay down, webhook
//!   unreachable). These degrade a single channel.
//! - Configuration failures. These are fatal at startup, before sampling.
//!
//! Every variant carries a stable code and a category so that the CLI can
//! map failures to exit codes and the logs can be filtered by class.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for kill-hogs operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file and CLI value errors.
    Config,
    /// Process sampling errors.
    Collection,
    /// Signal delivery errors.
    Enforcement,
    /// Terminal, webhook, and mail delivery errors.
    Notification,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Collection => write!(f, "collection"),
            ErrorCategory::Enforcement => write!(f, "enforcement"),
            ErrorCategory::Notification => write!(f, "notification"),
        }
    }
}

/// Unified error type for kill-hogs.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid account pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    // Collection errors (20-29)
    #[error("process collection failed: {0}")]
    Collection(String),

    #[error("process {pid} vanished")]
    ProcessVanished { pid: u32 },

    // Enforcement errors (40-49)
    #[error("signal delivery failed for process {pid}: {message}")]
    SignalFailed { pid: u32, message: String },

    #[error("request flag error: {0}")]
    RequestFlag(String),

    // Notification errors (50-59)
    #[error("notification via {channel} failed: {message}")]
    Notification { channel: String, message: String },
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Collection errors
    /// - 40-49: Enforcement errors
    /// - 50-59: Notification errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidValue { .. } => 11,
            Error::InvalidPattern { .. } => 12,
            Error::Collection(_) => 20,
            Error::ProcessVanished { .. } => 21,
            Error::SignalFailed { .. } => 40,
            Error::RequestFlag(_) => 41,
            Error::Notification { .. } => 50,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidValue { .. } | Error::InvalidPattern { .. } => {
                ErrorCategory::Config
            }

            Error::Collection(_) | Error::ProcessVanished { .. } => ErrorCategory::Collection,

            Error::SignalFailed { .. } | Error::RequestFlag(_) => ErrorCategory::Enforcement,

            Error::Notification { .. } => ErrorCategory::Notification,
        }
    }

    /// Whether the error leaves the current run able to continue.
    ///
    /// Configuration errors abort the run before sampling starts; everything
    /// else is confined to a single process or notification channel.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) | Error::InvalidValue { .. } | Error::InvalidPattern { .. } => false,

            Error::Collection(_) => false,
            Error::ProcessVanished { .. } => true,

            Error::SignalFailed { .. } => true,
            Error::RequestFlag(_) => false,

            Error::Notification { .. } => true,
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidValue { .. } => "Invalid Configuration Value",
            Error::InvalidPattern { .. } => "Invalid Account Pattern",
            Error::Collection(_) => "Process Collection Error",
            Error::ProcessVanished { .. } => "Process Vanished",
            Error::SignalFailed { .. } => "Signal Delivery Failed",
            Error::RequestFlag(_) => "Request Flag Error",
            Error::Notification { .. } => "Notification Failed",
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::InvalidValue { .. } => {
                "Run 'kill-hogs check-config' to validate the configuration file."
            }
            Error::InvalidPattern { .. } => {
                "user_pattern must be a valid regular expression; look-around assertions are not supported."
            }
            Error::Collection(_) => "Check that /proc is mounted and readable.",
            Error::ProcessVanished { .. } => {
                "The process exited during sampling. This is normal for short-lived processes."
            }
            Error::SignalFailed { .. } => {
                "Run kill-hogs as root, or grant CAP_KILL to signal other users' processes."
            }
            Error::RequestFlag(_) => {
                "Check permissions on the request flag path (request_flag_path)."
            }
            Error::Notification { .. } => {
                "Check the webhook URL, the local mail relay, and that `w`, `write` and `finger` are installed."
            }
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the current run could continue past this error.
    pub recoverable: bool,

    /// Additional structured context (e.g., pid, field name).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::ProcessVanished { pid } | Error::SignalFailed { pid, .. } => {
                context.insert("pid".to_string(), serde_json::json!(pid));
            }
            Error::InvalidValue { field, .. } => {
                context.insert("field".to_string(), serde_json::json!(field));
            }
            Error::InvalidPattern { pattern, .. } => {
                context.insert("pattern".to_string(), serde_json::json!(pattern));
            }
            Error::Notification { channel, .. } => {
                context.insert("channel".to_string(), serde_json::json!(channel));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            context,
        }
    }
}

impl StructuredError {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}

/// Format an error for human consumption (headline, reason, fix).
pub fn format_error_human(err: &Error) -> String {
    format!(
        "✗ {}\n  Reason: {}\n  Fix: {}",
        err.headline(),
        err,
        err.remediation()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(Error::Config("x".into()).code(), 10);
        assert_eq!(Error::ProcessVanished { pid: 1 }.code(), 21);
        assert_eq!(
            Error::Notification {
                channel: "mail".into(),
                message: "relay down".into()
            }
            .code(),
            50
        );
    }

    #[test]
    fn test_error_category() {
        assert_eq!(Error::Config("x".into()).category(), ErrorCategory::Config);
        assert_eq!(
            Error::SignalFailed {
                pid: 9,
                message: "gone".into()
            }
            .category(),
            ErrorCategory::Enforcement
        );
        assert_eq!(
            Error::Collection("no /proc".into()).category(),
            ErrorCategory::Collection
        );
    }

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(!Error::Config("x".into()).is_recoverable());
        assert!(!Error::InvalidPattern {
            pattern: "(".into(),
            message: "unclosed group".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_per_process_errors_are_recoverable() {
        assert!(Error::ProcessVanished { pid: 42 }.is_recoverable());
        assert!(!Error::Collection("no /proc".into()).is_recoverable());
    }

    #[test]
    fn test_structured_error_carries_context() {
        let err = Error::SignalFailed {
            pid: 1234,
            message: "EPERM".into(),
        };
        let structured = StructuredError::from(&err);
        assert_eq!(structured.code, 40);
        assert_eq!(structured.category, ErrorCategory::Enforcement);
        assert!(structured.recoverable);
        assert_eq!(structured.context.get("pid"), Some(&serde_json::json!(1234)));

        let json = structured.to_json();
        assert!(json.contains("\"category\":\"enforcement\""));
    }

    #[test]
    fn test_format_error_human() {
        let text = format_error_human(&Error::Config("missing thresholds".into()));
        assert!(text.contains("Configuration Error"));
        assert!(text.contains("missing thresholds"));
        assert!(text.contains("check-config"));
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Notification.to_string(), "notification");
        assert_eq!(ErrorCategory::Collection.to_string(), "collection");
    }
}
