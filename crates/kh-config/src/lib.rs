//! kill-hogs configuration loading and validation.
//!
//! This crate provides:
//! - The typed YAML settings schema with built-in defaults
//! - Config file resolution (CLI → env → home → /etc → defaults)
//! - Semantic validation, run before any sampling happens

pub mod resolve;
pub mod settings;
pub mod validate;

pub use resolve::{resolve_config_path, ConfigSource, ResolvedPath};
pub use settings::{load_settings, ConfigError, LoadedSettings, Overrides, Settings, WebhookIdentity};
pub use validate::{compile_user_pattern, validate_settings, ValidationError, ValidationResult};

/// Default location of the on-demand request flag.
pub const DEFAULT_REQUEST_FLAG_PATH: &str = "/tmp/kill_hogs_flagfile";
