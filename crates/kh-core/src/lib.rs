//! kill-hogs core library.
//!
//! Enforces per-account CPU, memory, and GPU wall-time limits on shared
//! login nodes:
//! - `collect`: /proc sampling, GPU attachment, bounded helper commands
//! - `sample`, `aggregate`, `policy`: the measurement and decision pipeline
//! - `enforce`: request-flag gate, reports, SIGTERM/SIGKILL escalation
//! - `notify`: terminal, webhook, and e-mail delivery
//! - `run`: one end-to-end invocation
//!
//! The binary entry point is in `main.rs`.

pub mod aggregate;
pub mod collect;
pub mod enforce;
pub mod exit_codes;
pub mod logging;
pub mod notify;
pub mod policy;
pub mod run;
pub mod sample;

pub use exit_codes::ExitCode;
pub use run::{run_once, Collaborators, LiveCollaborators, RunError, RunSummary};
