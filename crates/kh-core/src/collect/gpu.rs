//! GPU attachment lookup backed by `nvidia-smi`.

use super::source::GpuSource;
use super::tool_runner::{ToolError, ToolRunner};
use std::collections::HashSet;
use tracing::{debug, warn};

const NVIDIA_SMI: &str = "nvidia-smi";
const QUERY_ARGS: &[&str] = &["--query-compute-apps=pid", "--format=csv,noheader"];

/// Exit status a shell reports for a missing command.
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Lists PIDs holding an NVIDIA compute context.
#[derive(Debug, Clone, Default)]
pub struct NvidiaSmi {
    runner: ToolRunner,
}

impl NvidiaSmi {
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }
}

impl GpuSource for NvidiaSmi {
    fn attached_pids(&self) -> HashSet<u32> {
        match self.runner.run_tool(NVIDIA_SMI, QUERY_ARGS) {
            Ok(output) if output.success() => parse_compute_apps(&output.stdout_str()),
            Ok(output) if output.exit_code == Some(EXIT_COMMAND_NOT_FOUND) => {
                debug!("nvidia-smi not installed; no GPU processes");
                HashSet::new()
            }
            Ok(output) => {
                warn!(
                    exit_code = ?output.exit_code,
                    timed_out = output.timed_out,
                    stderr = %output.stderr_str().trim(),
                    "nvidia-smi failed; treating no process as GPU-attached"
                );
                HashSet::new()
            }
            Err(ToolError::CommandNotFound(_)) => {
                debug!("nvidia-smi not installed; no GPU processes");
                HashSet::new()
            }
            Err(e) => {
                warn!(error = %e, "nvidia-smi could not run; treating no process as GPU-attached");
                HashSet::new()
            }
        }
    }
}

/// Parse `nvidia-smi --query-compute-apps=pid --format=csv,noheader` output.
///
/// One PID per line; anything that is not a PID (blank lines, `[N/A]`,
/// "No running processes found") is skipped.
pub fn parse_compute_apps(stdout: &str) -> HashSet<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}
