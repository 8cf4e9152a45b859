//! Sampled process values.

use chrono::{DateTime, Utc};
use kh_common::{Account, ProcessId};
use serde::{Deserialize, Serialize};

/// Outcome of reading one attribute of a live process.
///
/// A process can exit or change hands between any two reads, so every
/// per-process reading says explicitly whether it saw the process.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading<T> {
    /// The attribute was read.
    Ok(T),
    /// The process no longer exists (or its PID now names another process).
    Vanished,
    /// The process exists but the attribute is not readable by us.
    PermissionDenied,
}

impl<T> Reading<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Reading::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reading::Ok(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reading<U> {
        match self {
            Reading::Ok(v) => Reading::Ok(f(v)),
            Reading::Vanished => Reading::Vanished,
            Reading::PermissionDenied => Reading::PermissionDenied,
        }
    }

    /// Map an I/O error from a `/proc` read onto a reading.
    pub fn from_io_error(err: &std::io::Error) -> Reading<T> {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Reading::PermissionDenied,
            _ => Reading::Vanished,
        }
    }
}

/// One sampled process.
///
/// Built only for processes that answered every read of the sampling
/// window. Plain data: no OS handle survives past the sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: ProcessId,
    pub uid: u32,
    pub owner: Account,
    /// Display name (the kernel's `comm`).
    pub name: String,
    /// CPU usage over the sampling window; 100 per fully used logical core.
    pub cpu_percent: f64,
    /// Resident memory as a percentage of physical memory.
    pub memory_percent: f64,
    pub created_at: DateTime<Utc>,
    /// Whether the PID held a GPU compute context during sampling.
    pub gpu_attached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_map_preserves_failures() {
        assert_eq!(Reading::Ok(2).map(|v| v * 2), Reading::Ok(4));
        assert_eq!(Reading::<i32>::Vanished.map(|v| v * 2), Reading::Vanished);
        assert_eq!(
            Reading::<i32>::PermissionDenied.map(|v| v * 2),
            Reading::PermissionDenied
        );
    }

    #[test]
    fn reading_from_io_error() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(Reading::<u32>::from_io_error(&denied), Reading::PermissionDenied);
        assert_eq!(Reading::<u32>::from_io_error(&missing), Reading::Vanished);
    }
}
