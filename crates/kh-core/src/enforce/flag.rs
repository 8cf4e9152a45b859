//! On-demand request flag.
//!
//! A marker file whose presence means "enforcement was requested since the
//! last on-demand run". Consumption is a single `unlink`: whichever run
//! removes the file acts, every other run sees it absent.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors touching the request flag.
#[derive(Debug, Error)]
pub enum FlagError {
    #[error("failed to create request flag {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to consume request flag {path}: {source}")]
    Consume {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FlagError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            FlagError::Create { source, .. } | FlagError::Consume { source, .. } => {
                source.kind() == ErrorKind::PermissionDenied
            }
        }
    }
}

impl From<FlagError> for kh_common::Error {
    fn from(err: FlagError) -> Self {
        kh_common::Error::RequestFlag(err.to_string())
    }
}

/// Persisted one-shot boolean.
pub trait RequestFlag {
    /// Whether a request is pending.
    fn exists(&self) -> bool;

    /// Atomically clear a pending request. Returns whether one was pending.
    fn consume(&self) -> Result<bool, FlagError>;

    /// Record a request. Idempotent.
    fn create(&self) -> Result<(), FlagError>;
}

/// Request flag stored as a file.
#[derive(Debug, Clone)]
pub struct FileRequestFlag {
    path: PathBuf,
}

impl FileRequestFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RequestFlag for FileRequestFlag {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn consume(&self) -> Result<bool, FlagError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "request flag consumed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(FlagError::Consume {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn create(&self) -> Result<(), FlagError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map(|_| ())
            .map_err(|source| FlagError::Create {
                path: self.path.clone(),
                source,
            })
    }
}
