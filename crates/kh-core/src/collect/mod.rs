//! Process and host data collection.
//!
//! The sampler only talks to the [`ProcessSource`] and [`GpuSource`] traits.
//! Live implementations read `/proc` and run `nvidia-smi`; every external
//! command goes through the bounded [`ToolRunner`].

pub mod gpu;
pub mod procfs;
pub mod source;
pub mod tool_runner;
pub mod types;
pub mod users;

pub use gpu::{parse_compute_apps, NvidiaSmi};
pub use procfs::{ProcfsHandle, ProcfsSource, SystemInfo};
pub use source::{CollectError, GpuSource, NoGpu, ProcessHandle, ProcessSource};
pub use tool_runner::{ToolError, ToolOutput, ToolRunner, ToolSpec};
pub use types::{ProcessRecord, Reading};
pub use users::{username_for_uid, UserCache};
