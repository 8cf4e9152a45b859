//! Threshold policy over per-account aggregates.
//!
//! An account violates when any of its totals is strictly greater than the
//! corresponding threshold. Equality is not a violation. The GPU limit only
//! applies when its ceiling is positive.

use crate::aggregate::{AccountAggregate, Aggregates};
use kh_common::Account;
use kh_config::Settings;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-account limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Summed memory percentage.
    pub memory_percent: f64,
    /// Summed CPU percentage, 100 per core.
    pub cpu_percent: f64,
    /// GPU wall-time ceiling in minutes; zero or less disables the limit.
    pub gpu_minutes: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory_percent: 10.0,
            cpu_percent: 600.0,
            gpu_minutes: 0.0,
        }
    }
}

impl Thresholds {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            memory_percent: settings.memory_threshold,
            cpu_percent: settings.cpu_threshold,
            gpu_minutes: settings.gpu_max_walltime,
        }
    }

    pub fn gpu_enabled(&self) -> bool {
        self.gpu_minutes > 0.0
    }
}

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

/// Which limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Cpu,
    Memory,
    GpuWalltime,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::Cpu => write!(f, "cpu"),
            LimitKind::Memory => write!(f, "memory"),
            LimitKind::GpuWalltime => write!(f, "gpu_walltime"),
        }
    }
}

/// One exceeded limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExceededLimit {
    pub kind: LimitKind,
    pub observed: f64,
    pub threshold: f64,
}

/// An account over at least one limit, with its usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub account: Account,
    pub exceeded: Vec<ExceededLimit>,
    pub usage: AccountAggregate,
}

impl Violation {
    pub fn exceeds(&self, kind: LimitKind) -> bool {
        self.exceeded.iter().any(|limit| limit.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Limits `usage` strictly exceeds.
pub fn exceeded_limits(usage: &AccountAggregate, thresholds: &Thresholds) -> Vec<ExceededLimit> {
    let mut exceeded = Vec::new();

    if usage.cpu_percent_total > thresholds.cpu_percent {
        exceeded.push(ExceededLimit {
            kind: LimitKind::Cpu,
            observed: usage.cpu_percent_total,
            threshold: thresholds.cpu_percent,
        });
    }
    if usage.memory_percent_total > thresholds.memory_percent {
        exceeded.push(ExceededLimit {
            kind: LimitKind::Memory,
            observed: usage.memory_percent_total,
            threshold: thresholds.memory_percent,
        });
    }
    if thresholds.gpu_enabled() && usage.gpu_wall_minutes > thresholds.gpu_minutes {
        exceeded.push(ExceededLimit {
            kind: LimitKind::GpuWalltime,
            observed: usage.gpu_wall_minutes,
            threshold: thresholds.gpu_minutes,
        });
    }

    exceeded
}

/// One violation per offending account.
pub fn evaluate(aggregates: &Aggregates, thresholds: &Thresholds) -> Vec<Violation> {
    aggregates
        .iter()
        .filter_map(|(account, usage)| {
            let exceeded = exceeded_limits(usage, thresholds);
            (!exceeded.is_empty()).then(|| Violation {
                account: account.clone(),
                exceeded,
                usage: usage.clone(),
            })
        })
        .collect()
}
