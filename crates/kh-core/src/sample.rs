//! Two-phase CPU sampling.
//!
//! CPU usage is a rate, so it needs two reads: every process is primed once,
//! the sampler sleeps for the measurement window, and the second read yields
//! usage over that window. The sleep is the only deliberate blocking point of
//! a run.
//!
//! Filtering, in order, per process:
//! 1. vanished (or unreadable) since the prime read
//! 2. owned by the superuser
//! 3. below the low-usage floor (memory < 0.1 % and CPU < 1 %)
//! 4. display name on the software whitelist
//! 5. owner outside the restriction pattern

use crate::collect::{
    CollectError, GpuSource, ProcessHandle, ProcessRecord, ProcessSource, Reading,
};
use crate::logging::event_names;
use kh_common::SUPERUSER_UID;
use kh_config::{compile_user_pattern, Settings, ValidationError};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, trace};

/// Processes below both of these are never attributed to an account.
pub const MEMORY_FLOOR_PERCENT: f64 = 0.1;
pub const CPU_FLOOR_PERCENT: f64 = 1.0;

/// Sampler configuration.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Length of the CPU measurement window.
    pub interval: Duration,
    /// Accounts whose name matches are restricted. `None` restricts all.
    pub user_pattern: Option<Regex>,
    /// Process names that never count.
    pub software_whitelist: HashSet<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(300),
            user_pattern: None,
            software_whitelist: HashSet::new(),
        }
    }
}

impl SamplerConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ValidationError> {
        Ok(Self {
            interval: Duration::from_secs_f64(settings.cpu_interval),
            user_pattern: compile_user_pattern(settings.user_pattern.as_deref())?,
            software_whitelist: settings.software_whitelist.iter().cloned().collect(),
        })
    }

    fn is_restricted(&self, account: &str) -> bool {
        self.user_pattern
            .as_ref()
            .map_or(true, |pattern| pattern.is_match(account))
    }
}

/// Why processes were left out of a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub vanished: usize,
    pub permission_denied: usize,
    pub superuser: usize,
    pub below_floor: usize,
    pub whitelisted: usize,
    pub unrestricted: usize,
}

impl DropCounts {
    pub fn total(&self) -> usize {
        self.vanished
            + self.permission_denied
            + self.superuser
            + self.below_floor
            + self.whitelisted
            + self.unrestricted
    }
}

/// Result of one sampling pass.
#[derive(Debug, Clone, Default)]
pub struct SampleReport {
    /// Processes listed at the start of the pass.
    pub scanned: usize,
    pub records: Vec<ProcessRecord>,
    pub dropped: DropCounts,
}

/// Takes one sample of the host's processes.
pub struct Sampler<'a> {
    source: &'a dyn ProcessSource,
    gpu: &'a dyn GpuSource,
    config: SamplerConfig,
}

enum Dropped {
    Vanished,
    PermissionDenied,
    Superuser,
    BelowFloor,
    Whitelisted,
    Unrestricted,
}

fn check<T>(reading: Reading<T>) -> Result<T, Dropped> {
    match reading {
        Reading::Ok(v) => Ok(v),
        Reading::Vanished => Err(Dropped::Vanished),
        Reading::PermissionDenied => Err(Dropped::PermissionDenied),
    }
}

impl<'a> Sampler<'a> {
    pub fn new(source: &'a dyn ProcessSource, gpu: &'a dyn GpuSource, config: SamplerConfig) -> Self {
        Self {
            source,
            gpu,
            config,
        }
    }

    /// Run the prime read, sleep, second read, and filters.
    pub fn sample(&self) -> Result<SampleReport, CollectError> {
        let mut handles = self.source.list_processes()?;
        let mut report = SampleReport {
            scanned: handles.len(),
            ..SampleReport::default()
        };

        // Prime. The values returned here are meaningless by contract.
        handles.retain_mut(|handle| match handle.cpu_percent() {
            Reading::Ok(_) => true,
            Reading::Vanished => {
                report.dropped.vanished += 1;
                false
            }
            Reading::PermissionDenied => {
                report.dropped.permission_denied += 1;
                false
            }
        });

        let gpu_pids = self.gpu.attached_pids();
        trace!(gpu_pids = gpu_pids.len(), "gpu attachment queried");

        std::thread::sleep(self.config.interval);

        for mut handle in handles {
            let pid = handle.pid();
            match self.measure(handle.as_mut(), &gpu_pids) {
                Ok(record) => report.records.push(record),
                Err(reason) => {
                    let counter = match reason {
                        Dropped::Vanished => &mut report.dropped.vanished,
                        Dropped::PermissionDenied => &mut report.dropped.permission_denied,
                        Dropped::Superuser => &mut report.dropped.superuser,
                        Dropped::BelowFloor => &mut report.dropped.below_floor,
                        Dropped::Whitelisted => &mut report.dropped.whitelisted,
                        Dropped::Unrestricted => &mut report.dropped.unrestricted,
                    };
                    *counter += 1;
                    trace!(pid = pid.0, "process dropped from sample");
                }
            }
        }

        debug!(
            target: event_names::SCAN_SAMPLED,
            scanned = report.scanned,
            kept = report.records.len(),
            vanished = report.dropped.vanished,
            superuser = report.dropped.superuser,
            below_floor = report.dropped.below_floor,
            whitelisted = report.dropped.whitelisted,
            unrestricted = report.dropped.unrestricted,
            "sample taken"
        );
        Ok(report)
    }

    fn measure(
        &self,
        handle: &mut dyn ProcessHandle,
        gpu_pids: &HashSet<u32>,
    ) -> Result<ProcessRecord, Dropped> {
        let cpu_percent = check(handle.cpu_percent())?;
        let memory_percent = check(handle.memory_percent())?;

        let uid = check(handle.uid())?;
        if uid == SUPERUSER_UID {
            return Err(Dropped::Superuser);
        }

        if memory_percent < MEMORY_FLOOR_PERCENT && cpu_percent < CPU_FLOOR_PERCENT {
            return Err(Dropped::BelowFloor);
        }

        let name = check(handle.name())?;
        if self.config.software_whitelist.contains(&name) {
            return Err(Dropped::Whitelisted);
        }

        let owner = check(handle.owner())?;
        if !self.config.is_restricted(owner.as_str()) {
            return Err(Dropped::Unrestricted);
        }

        let created_at = check(handle.created_at())?;
        let pid = handle.pid();

        Ok(ProcessRecord {
            pid,
            uid,
            owner,
            name,
            cpu_percent,
            memory_percent,
            created_at,
            gpu_attached: gpu_pids.contains(&pid.0),
        })
    }
}
