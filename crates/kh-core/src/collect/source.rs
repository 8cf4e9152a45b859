//! Collaborator seams for process enumeration and GPU attachment.

use super::types::Reading;
use chrono::{DateTime, Utc};
use kh_common::{Account, ProcessId};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

/// Errors enumerating processes.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl From<CollectError> for kh_common::Error {
    fn from(err: CollectError) -> Self {
        kh_common::Error::Collection(err.to_string())
    }
}

/// A live process, queried attribute by attribute.
///
/// `cpu_percent` is stateful: the first call after discovery primes the
/// measurement and its value is meaningless; each later call reports usage
/// since the previous call.
pub trait ProcessHandle: Send {
    fn pid(&self) -> ProcessId;
    fn cpu_percent(&mut self) -> Reading<f64>;
    fn memory_percent(&mut self) -> Reading<f64>;
    fn uid(&mut self) -> Reading<u32>;
    fn owner(&mut self) -> Reading<Account>;
    fn name(&mut self) -> Reading<String>;
    fn created_at(&mut self) -> Reading<DateTime<Utc>>;
}

/// Enumerates the live processes of the host.
pub trait ProcessSource {
    fn list_processes(&self) -> Result<Vec<Box<dyn ProcessHandle>>, CollectError>;
}

/// Reports which PIDs currently hold a GPU compute context.
///
/// Implementations return an empty set when no GPU tooling is installed.
pub trait GpuSource {
    fn attached_pids(&self) -> HashSet<u32>;
}

/// GPU source for hosts without GPUs, or when GPU accounting is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGpu;

impl GpuSource for NoGpu {
    fn attached_pids(&self) -> HashSet<u32> {
        HashSet::new()
    }
}
