//! Pipeline stages and stable event names.
//!
//! Event names are used as `tracing` targets so JSONL consumers can filter
//! on them without parsing messages.

use serde::{Deserialize, Serialize};

/// Stages of one enforcement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    /// On-demand request flag check.
    Gate,
    /// Two-phase process sampling.
    Scan,
    /// Per-account totals and threshold comparison.
    Evaluate,
    /// Offender notification.
    Notify,
    /// Signal delivery.
    Enforce,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Gate => "gate",
            Stage::Scan => "scan",
            Stage::Evaluate => "evaluate",
            Stage::Notify => "notify",
            Stage::Enforce => "enforce",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Run lifecycle
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FINISHED: &str = "run.finished";

    // Config
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_ERROR: &str = "config.error";

    // Gate
    pub const ENFORCE_GATE_CLOSED: &str = "enforce.gate_closed";
    pub const ENFORCE_GATE_OPENED: &str = "enforce.gate_opened";
    pub const REQUEST_CREATED: &str = "request.created";

    // Scan and evaluation
    pub const SCAN_SAMPLED: &str = "scan.sampled";
    pub const SCAN_FINISHED: &str = "scan.finished";
    pub const POLICY_VIOLATION: &str = "policy.violation";

    // Notification and enforcement
    pub const ENFORCE_REPORT: &str = "enforce.report";
    pub const NOTIFY_DISPATCHED: &str = "notify.dispatched";
    pub const ENFORCE_TERMINATED: &str = "enforce.terminated";

    /// Target prefixes of the names above, for the default log filter.
    pub const TARGET_PREFIXES: &[&str] = &[
        "run", "config", "enforce", "request", "scan", "policy", "notify",
    ];
}
