//! Configuration validation errors and semantic validation.

use crate::settings::Settings;
use regex::Regex;
use thiserror::Error;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid user_pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::MissingField(_) => 64,
            ValidationError::InvalidValue { .. } => 65,
            ValidationError::InvalidPattern { .. } => 66,
        }
    }
}

impl From<ValidationError> for kh_common::Error {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::MissingField(field) => kh_common::Error::InvalidValue {
                field,
                message: "required but not set".to_string(),
            },
            ValidationError::InvalidValue { field, message } => {
                kh_common::Error::InvalidValue { field, message }
            }
            ValidationError::InvalidPattern { pattern, message } => {
                kh_common::Error::InvalidPattern { pattern, message }
            }
        }
    }
}

/// Longest CPU measurement window accepted, in seconds.
const MAX_CPU_INTERVAL_SECS: f64 = 60.0;

/// Validate settings semantically.
///
/// Runs before any sampling so that a malformed configuration aborts the
/// run without side effects.
pub fn validate_settings(settings: &Settings) -> ValidationResult<()> {
    validate_threshold("memory_threshold", settings.memory_threshold)?;
    validate_threshold("cpu_threshold", settings.cpu_threshold)?;
    validate_threshold("gpu_max_walltime", settings.gpu_max_walltime)?;

    if !settings.cpu_interval.is_finite()
        || settings.cpu_interval <= 0.0
        || settings.cpu_interval > MAX_CPU_INTERVAL_SECS
    {
        return Err(ValidationError::InvalidValue {
            field: "cpu_interval".to_string(),
            message: format!(
                "must be in (0, {MAX_CPU_INTERVAL_SECS}] seconds, got {}",
                settings.cpu_interval
            ),
        });
    }

    compile_user_pattern(settings.user_pattern.as_deref())?;

    if settings.collaborator_timeout_secs == 0 {
        return Err(ValidationError::InvalidValue {
            field: "collaborator_timeout_secs".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if settings.request_flag_path.as_os_str().is_empty() {
        return Err(ValidationError::MissingField("request_flag_path".to_string()));
    }

    if settings.email {
        match settings.from_address.as_deref() {
            None | Some("") => {
                return Err(ValidationError::MissingField("from_address".to_string()));
            }
            Some(addr) if !addr.contains('@') => {
                return Err(ValidationError::InvalidValue {
                    field: "from_address".to_string(),
                    message: format!("{addr:?} is not an e-mail address"),
                });
            }
            Some(_) => {}
        }
        if settings.mail_server_port == 0 {
            return Err(ValidationError::InvalidValue {
                field: "mail_server_port".to_string(),
                message: "port 0 is not a valid relay port".to_string(),
            });
        }
    }

    if settings.slack {
        match settings.slack_url.as_deref() {
            None | Some("") => {
                return Err(ValidationError::MissingField("slack_url".to_string()));
            }
            Some(url) if !(url.starts_with("https://") || url.starts_with("http://")) => {
                return Err(ValidationError::InvalidValue {
                    field: "slack_url".to_string(),
                    message: format!("{url:?} is not an http(s) URL"),
                });
            }
            Some(_) => {}
        }
    }

    Ok(())
}

fn validate_threshold(field: &str, value: f64) -> ValidationResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("must be a non-negative number, got {value}"),
        });
    }
    Ok(())
}

/// Compile the account restriction pattern.
///
/// The pattern is anchored at the start of the account name (prefix match),
/// so `(s|p|f)[0-9]{5,7}` restricts `p123456` but not `xp123456`.
pub fn compile_user_pattern(pattern: Option<&str>) -> ValidationResult<Option<Regex>> {
    let Some(pattern) = pattern else {
        return Ok(None);
    };
    Regex::new(&format!("^(?:{pattern})"))
        .map(Some)
        .map_err(|e| ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}
