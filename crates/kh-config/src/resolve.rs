//! Configuration file resolution.
//!
//! Resolution order: CLI argument → `KILL_HOGS_CONFIG` → `~/.kill_hogs/` →
//! `/etc/kill_hogs/` → built-in defaults.

use std::path::{Path, PathBuf};

/// Where the configuration file was found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly provided via CLI argument.
    CliArgument,

    /// Set via environment variable.
    Environment,

    /// Found in the invoking user's home directory.
    HomeConfig,

    /// Found in /etc/kill_hogs/.
    SystemConfig,

    /// Using built-in defaults.
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::HomeConfig => write!(f, "home config"),
            ConfigSource::SystemConfig => write!(f, "system config"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// A resolved configuration path and its provenance.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPath {
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

const ENV_CONFIG_PATH: &str = "KILL_HOGS_CONFIG";
const CONFIG_FILENAME: &str = "kill_hogs.yml";
const HOME_DIR_NAME: &str = ".kill_hogs";
const SYSTEM_DIR: &str = "/etc/kill_hogs";

/// Resolve the configuration file path using the standard resolution order.
pub fn resolve_config_path(cli_path: Option<&Path>) -> ResolvedPath {
    // 1. CLI argument
    if let Some(path) = cli_path {
        if path.exists() {
            return ResolvedPath {
                path: Some(path.to_path_buf()),
                source: ConfigSource::CliArgument,
            };
        }
    }

    // 2. Environment variable
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return ResolvedPath {
                path: Some(path),
                source: ConfigSource::Environment,
            };
        }
    }

    // 3. Home directory
    if let Some(path) = home_config_path() {
        if path.exists() {
            return ResolvedPath {
                path: Some(path),
                source: ConfigSource::HomeConfig,
            };
        }
    }

    // 4. System config
    let system_path = system_config_path();
    if system_path.exists() {
        return ResolvedPath {
            path: Some(system_path),
            source: ConfigSource::SystemConfig,
        };
    }

    ResolvedPath::default()
}

/// `~/.kill_hogs/kill_hogs.yml` for the invoking user.
pub fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(HOME_DIR_NAME).join(CONFIG_FILENAME))
}

/// `/etc/kill_hogs/kill_hogs.yml`.
pub fn system_config_path() -> PathBuf {
    PathBuf::from(SYSTEM_DIR).join(CONFIG_FILENAME)
}
