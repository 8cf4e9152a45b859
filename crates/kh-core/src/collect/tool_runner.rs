//! Tool runner with timeout and output cap.
//!
//! Every collaborator that shells out (`nvidia-smi`, `w`, `write`,
//! `finger`) goes through this runner so that a hung command can never
//! keep enforcement from happening:
//!
//! - Per-command timeout with SIGTERM → SIGKILL escalation of the child
//! - Output size caps to prevent memory exhaustion
//! - Optional stdin payload, fed from a helper thread
//! - Command name validation to prevent injection
//!
//! # Example
//!
//! ```ignore
//! use kh_core::collect::tool_runner::{ToolRunner, ToolSpec};
//! use std::time::Duration;
//!
//! let runner = ToolRunner::with_timeout(Duration::from_secs(5));
//! let output = runner.run(&ToolSpec::new("w", vec!["-s".into(), "-h".into()]))?;
//! println!("{}", output.stdout_str());
//! ```

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Default timeout per command in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default maximum output size in bytes (1MB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Grace period between SIGTERM and SIGKILL in milliseconds.
const SIGTERM_GRACE_MS: u64 = 500;

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with non-zero status: {code}")]
    NonZeroExit { code: i32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// Output from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Command that was executed.
    pub command: String,

    /// Arguments passed to the command.
    pub args: Vec<String>,

    /// Standard output (may be truncated).
    pub stdout: Vec<u8>,

    /// Standard error (may be truncated).
    pub stderr: Vec<u8>,

    /// Exit code (if available).
    pub exit_code: Option<i32>,

    /// Whether output was truncated.
    pub truncated: bool,

    /// Execution duration.
    pub duration: Duration,

    /// Whether the command timed out.
    pub timed_out: bool,
}

impl ToolOutput {
    /// Get stdout as string (lossy UTF-8 conversion).
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as string (lossy UTF-8 conversion).
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert a finished run into an error unless it succeeded.
    pub fn into_success(self) -> Result<ToolOutput, ToolError> {
        if self.timed_out {
            return Err(ToolError::Timeout(self.duration));
        }
        match self.exit_code {
            Some(0) => Ok(self),
            Some(code) => Err(ToolError::NonZeroExit { code }),
            None => Err(ToolError::NonZeroExit { code: -1 }),
        }
    }
}

/// Specification for a tool to run.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Command to execute.
    pub command: String,

    /// Arguments to pass.
    pub args: Vec<String>,

    /// Bytes written to the command's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,

    /// Extra environment variables, applied after the locale defaults.
    pub env: Vec<(String, String)>,

    /// Override timeout (None = use the runner's).
    pub timeout: Option<Duration>,
}

impl ToolSpec {
    /// Create a new tool specification.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            stdin: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    /// Set an environment variable for the command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `input` to the command's stdin.
    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Set a custom timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Runs external commands with bounded time and output.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
    max_output_bytes: usize,
}

impl Default for ToolRunner {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ToolRunner {
    /// Create a runner with the given per-command timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Set the maximum captured bytes per stream.
    pub fn max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// The per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a tool with the given arguments.
    pub fn run_tool(&self, command: &str, args: &[&str]) -> Result<ToolOutput, ToolError> {
        let spec = ToolSpec::new(command, args.iter().map(|s| s.to_string()).collect());
        self.run(&spec)
    }

    /// Run a tool described by `spec`.
    ///
    /// A command that cannot be found yields [`ToolError::CommandNotFound`];
    /// a command that runs past its timeout is terminated and its partial
    /// output returned with `timed_out` set.
    pub fn run(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError> {
        validate_command(&spec.command)?;

        let timeout = spec.timeout.unwrap_or(self.timeout);
        let start = Instant::now();

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("LC_ALL", "C")
            .env("LANG", "C")
            .envs(spec.env.iter().map(|(k, v)| (k, v)));

        debug!(command = %spec.command, args = ?spec.args, ?timeout, "spawning tool");

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::CommandNotFound(spec.command.clone())
            } else {
                ToolError::SpawnFailed(format!("{}: {}", spec.command, e))
            }
        })?;

        let feeder = match (child.stdin.take(), spec.stdin.clone()) {
            (Some(stdin), Some(input)) => Some(spawn_stdin_feeder(stdin, input)),
            _ => None,
        };

        let result = self.execute_with_timeout(&mut child, timeout);

        if let Some(handle) = feeder {
            // A child that exits without draining stdin leaves the feeder with
            // EPIPE, which is not a failure of the run.
            if let Ok(Err(e)) = handle.join() {
                trace!(error = %e, "stdin feeder stopped early");
            }
        }

        let (stdout, stderr, exit_code, truncated, timed_out) = result?;
        let duration = start.elapsed();

        if timed_out {
            warn!(command = %spec.command, ?duration, "tool timed out");
        } else {
            trace!(command = %spec.command, ?exit_code, ?duration, "tool finished");
        }

        Ok(ToolOutput {
            command: spec.command.clone(),
            args: spec.args.clone(),
            stdout,
            stderr,
            exit_code,
            truncated,
            duration,
            timed_out,
        })
    }

    /// Execute a child process with timeout and output capture.
    #[allow(clippy::type_complexity)]
    fn execute_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<(Vec<u8>, Vec<u8>, Option<i32>, bool, bool), ToolError> {
        let max_output = self.max_output_bytes;
        let deadline = Instant::now() + timeout;
        let mut stdout_buf = Vec::with_capacity(max_output.min(65536));
        let mut stderr_buf = Vec::with_capacity(max_output.min(65536));
        let mut truncated = false;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut chunk = vec![0u8; 8192];

        loop {
            if Instant::now() >= deadline {
                warn!("command timed out, sending SIGTERM");
                kill_with_grace(child);
                let exit_code = child.wait().ok().and_then(|s| s.code());
                return Ok((stdout_buf, stderr_buf, exit_code, truncated, true));
            }

            let mut did_read = false;
            if let Some(ref mut out) = stdout {
                if let Ok(n) = try_read_nonblocking(out, &mut chunk) {
                    did_read |= n > 0;
                    append_capped(&mut stdout_buf, &chunk[..n], max_output, &mut truncated);
                }
            }
            if let Some(ref mut err) = stderr {
                if let Ok(n) = try_read_nonblocking(err, &mut chunk) {
                    did_read |= n > 0;
                    append_capped(&mut stderr_buf, &chunk[..n], max_output, &mut truncated);
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    if let Some(ref mut out) = stdout {
                        let _ = drain_to_limit(out, &mut stdout_buf, max_output, &mut truncated);
                    }
                    if let Some(ref mut err) = stderr {
                        let _ = drain_to_limit(err, &mut stderr_buf, max_output, &mut truncated);
                    }
                    return Ok((stdout_buf, stderr_buf, status.code(), truncated, false));
                }
                Ok(None) => {
                    if !did_read {
                        thread::sleep(Duration::from_millis(10));
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to wait for child");
                    return Err(ToolError::Io(e));
                }
            }
        }
    }
}

fn spawn_stdin_feeder(
    mut stdin: ChildStdin,
    input: Vec<u8>,
) -> thread::JoinHandle<std::io::Result<()>> {
    thread::spawn(move || {
        stdin.write_all(&input)?;
        stdin.flush()
    })
}

fn append_capped(buf: &mut Vec<u8>, data: &[u8], max: usize, truncated: &mut bool) {
    if data.is_empty() {
        return;
    }
    let space = max.saturating_sub(buf.len());
    let to_copy = data.len().min(space);
    buf.extend_from_slice(&data[..to_copy]);
    if data.len() > space {
        *truncated = true;
    }
}

/// Drain remaining data from a stream up to the limit.
///
/// Uses non-blocking reads to avoid hanging on grandchild processes
/// that may still hold the pipe open after the direct child exits.
fn drain_to_limit<R: Read + std::os::unix::io::AsRawFd>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
    truncated: &mut bool,
) -> std::io::Result<()> {
    let mut chunk = vec![0u8; 8192];
    while !*truncated {
        match try_read_nonblocking(stream, &mut chunk) {
            Ok(0) => break,
            Ok(n) => append_capped(buf, &chunk[..n], max, truncated),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Kill a child with SIGTERM, then SIGKILL after a grace period.
fn kill_with_grace(child: &mut Child) {
    let pid = child.id() as i32;

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    debug!(pid, "sent SIGTERM");

    thread::sleep(Duration::from_millis(SIGTERM_GRACE_MS));

    match child.try_wait() {
        Ok(Some(_)) => trace!(pid, "process exited after SIGTERM"),
        Ok(None) => {
            warn!(pid, "process did not exit after SIGTERM, sending SIGKILL");
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        Err(e) => error!(pid, error = %e, "failed to check process status"),
    }
}

/// Try to read from a stream without blocking.
///
/// Sets O_NONBLOCK on the descriptor for the duration of one read.
/// Returns Ok(0) if no data is available (EAGAIN/EWOULDBLOCK).
fn try_read_nonblocking<R: Read + std::os::unix::io::AsRawFd>(
    stream: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let fd = stream.as_raw_fd();

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let was_nonblocking = (flags & libc::O_NONBLOCK) != 0;
    if !was_nonblocking {
        let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if result < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    let result = stream.read(buf);

    if !was_nonblocking {
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, flags);
        }
    }

    match result {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

/// Reject command names that could smuggle shell syntax.
///
/// Commands are executed directly (never through a shell), but names come
/// from code and configuration, so anything that looks like shell syntax is
/// refused outright.
fn validate_command(command: &str) -> Result<(), ToolError> {
    if command.is_empty() {
        return Err(ToolError::InvalidCommand("empty command".to_string()));
    }
    const FORBIDDEN: &[char] = &[
        ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r', ' ', '\t', '*', '?',
    ];
    if command.contains(FORBIDDEN) {
        return Err(ToolError::InvalidCommand(command.to_string()));
    }
    Ok(())
}
