//! Typed settings schema for `kill_hogs.yml`.
//!
//! Every field has a built-in default so that a partial file (or no file at
//! all) still yields a complete configuration. Key names follow the
//! historical flat layout of the file (`user_pattern`, `slack_url`,
//! `mail_body`, ...), so existing deployments keep working.

use crate::resolve::{resolve_config_path, ConfigSource};
use crate::validate::{validate_settings, ValidationError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid YAML in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Semantic validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl From<ConfigError> for kh_common::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ValidationError(v) => v.into(),
            other => kh_common::Error::Config(other.to_string()),
        }
    }
}

/// Identity the chat webhook posts under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookIdentity {
    pub channel: String,
    pub username: String,
    pub icon_emoji: String,
}

impl Default for WebhookIdentity {
    fn default() -> Self {
        Self {
            channel: "#kill-hogs".to_string(),
            username: "kill-hogs".to_string(),
            icon_emoji: ":scales:".to_string(),
        }
    }
}

/// Complete kill-hogs settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Memory percentage (summed per account) above which processes are killed.
    pub memory_threshold: f64,

    /// CPU percentage (summed per account, 100 per core) above which processes are killed.
    pub cpu_threshold: f64,

    /// GPU wall-time ceiling in minutes. Zero disables GPU accounting.
    pub gpu_max_walltime: f64,

    /// Length of the CPU measurement window in seconds.
    pub cpu_interval: f64,

    /// Regular expression matched against the start of account names.
    /// Accounts that do not match are never restricted. `None` restricts
    /// every account except the superuser.
    pub user_pattern: Option<String>,

    /// Process names whose usage is never counted.
    pub software_whitelist: Vec<String>,

    /// Text written to the terminals of an offending user.
    pub terminal_warning: String,

    /// E-mail body for continuous enforcement, followed by the report.
    pub mail_body: String,

    /// E-mail body for on-demand enforcement, followed by the report.
    pub mail_body_request_only: String,

    /// Sender address for offender e-mail.
    pub from_address: Option<String>,

    /// Port of the local mail relay.
    pub mail_server_port: u16,

    /// Chat webhook URL.
    #[serde(alias = "webhook_url")]
    pub slack_url: Option<String>,

    pub webhook: WebhookIdentity,

    /// Marker file used by on-demand mode.
    pub request_flag_path: PathBuf,

    /// Upper bound on any single collaborator call (commands, webhook, SMTP).
    pub collaborator_timeout_secs: u64,

    /// Only report what would be killed.
    pub dummy: bool,

    /// Mail offenders when their processes are killed.
    pub email: bool,

    /// Post reports to the chat webhook.
    pub slack: bool,

    /// Only enforce when a request flag is present.
    pub request_only: bool,
}

pub const DEFAULT_TERMINAL_WARNING: &str = "Please submit your processes as a job.
Your processes have been killed and this incident has been reported.";

pub const DEFAULT_MAIL_BODY: &str = "Dear cluster user,

We detected resource intensive processes on the login node running from your account.
The login node is shared by all users of the cluster. A high load on it impairs
the usability of the cluster for everybody else, so processes that take a
significant amount of memory or CPU are not allowed there.

The output of our check follows below:
";

pub const DEFAULT_MAIL_BODY_REQUEST_ONLY: &str = "Dear cluster user,

We detected resource intensive processes on the interactive node running from your account.
Your processes were killed upon a request by another user.
The interactive node is meant for heavier processes but it should still be available to other users.

The output of our check follows below:
";

impl Default for Settings {
    fn default() -> Self {
        Self {
            memory_threshold: 10.0,
            cpu_threshold: 600.0,
            gpu_max_walltime: 0.0,
            cpu_interval: 0.3,
            user_pattern: None,
            software_whitelist: Vec::new(),
            terminal_warning: DEFAULT_TERMINAL_WARNING.to_string(),
            mail_body: DEFAULT_MAIL_BODY.to_string(),
            mail_body_request_only: DEFAULT_MAIL_BODY_REQUEST_ONLY.to_string(),
            from_address: None,
            mail_server_port: 25,
            slack_url: None,
            webhook: WebhookIdentity::default(),
            request_flag_path: PathBuf::from(crate::DEFAULT_REQUEST_FLAG_PATH),
            collaborator_timeout_secs: 10,
            dummy: false,
            email: false,
            slack: false,
            request_only: false,
        }
    }
}

/// Values supplied on the command line. `Some` wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub memory_threshold: Option<f64>,
    pub cpu_threshold: Option<f64>,
    pub gpu_max_walltime: Option<f64>,
    pub cpu_interval: Option<f64>,
    pub dummy: bool,
    pub email: bool,
    pub slack: bool,
    pub request_only: bool,
}

impl Settings {
    /// Parse settings from YAML text. An empty document yields the defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str(content)
    }

    /// Load settings from a specific file.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::IoError {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        Settings::from_yaml_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply command-line overrides. Flags only ever switch a mode on.
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(v) = overrides.memory_threshold {
            self.memory_threshold = v;
        }
        if let Some(v) = overrides.cpu_threshold {
            self.cpu_threshold = v;
        }
        if let Some(v) = overrides.gpu_max_walltime {
            self.gpu_max_walltime = v;
        }
        if let Some(v) = overrides.cpu_interval {
            self.cpu_interval = v;
        }
        self.dummy |= overrides.dummy;
        self.email |= overrides.email;
        self.slack |= overrides.slack;
        self.request_only |= overrides.request_only;
    }

    /// Whether GPU wall-time accounting is active.
    pub fn gpu_accounting_enabled(&self) -> bool {
        self.gpu_max_walltime > 0.0
    }

    /// Serialize to YAML (used by `check-config`).
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Settings together with where they came from.
#[derive(Debug, Clone)]
pub struct LoadedSettings {
    pub settings: Settings,
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

/// Resolve, load, override, and validate the settings in one step.
///
/// An explicitly requested file that does not exist is an error; a missing
/// file in the default locations falls back to built-in defaults.
pub fn load_settings(
    cli_path: Option<&Path>,
    overrides: &Overrides,
) -> Result<LoadedSettings, ConfigError> {
    if let Some(path) = cli_path {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
    }

    let resolved = resolve_config_path(cli_path);
    let mut settings = match &resolved.path {
        Some(path) => Settings::load_from_path(path)?,
        None => Settings::default(),
    };
    debug!(source = %resolved.source, path = ?resolved.path, "configuration resolved");

    settings.apply_overrides(overrides);
    validate_settings(&settings)?;

    Ok(LoadedSettings {
        settings,
        path: resolved.path,
        source: resolved.source,
    })
}
