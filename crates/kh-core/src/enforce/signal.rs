//! Signal delivery and staged termination.
//!
//! Termination of an account's process set:
//! 1. SIGTERM to every process
//! 2. poll the whole set until each has exited or the shared grace deadline
//!    passes
//! 3. SIGKILL to every survivor
//!
//! The deadline is fixed when the SIGTERM sweep ends, so one process exiting
//! early changes nothing for the others.
//!
//! Every signal names a [`SignalTarget`], the PID together with the UID and
//! start time seen during sampling. Notification can take a while, and a PID
//! whose process exited in the meantime may already belong to someone else;
//! such a target is treated as gone and never signalled.

use crate::collect::procfs::{parse_stat, parse_status_uid, start_time};
use crate::collect::{ProcessRecord, SystemInfo};
use chrono::{DateTime, Utc};
use kh_common::ProcessId;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Signals the enforcer sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn as_raw(self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Term => write!(f, "SIGTERM"),
            Signal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// The sampled process a signal is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalTarget {
    pub pid: ProcessId,
    pub uid: u32,
    pub started_at: DateTime<Utc>,
}

impl From<&ProcessRecord> for SignalTarget {
    fn from(record: &ProcessRecord) -> Self {
        Self {
            pid: record.pid,
            uid: record.uid,
            started_at: record.created_at,
        }
    }
}

/// Signal delivery failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("process {pid} not found")]
    NotFound { pid: u32 },

    #[error("pid {pid} now belongs to a different process")]
    Replaced { pid: u32 },

    #[error("permission denied signalling process {pid}")]
    PermissionDenied { pid: u32 },

    #[error("signal to process {pid} failed: {message}")]
    Failed { pid: u32, message: String },
}

impl SignalError {
    /// The target no longer exists, under its PID or at all.
    pub fn target_gone(&self) -> bool {
        matches!(self, SignalError::NotFound { .. } | SignalError::Replaced { .. })
    }
}

impl From<SignalError> for kh_common::Error {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::NotFound { pid } | SignalError::Replaced { pid } => {
                kh_common::Error::ProcessVanished { pid }
            }
            SignalError::PermissionDenied { pid } => kh_common::Error::SignalFailed {
                pid,
                message: "permission denied".to_string(),
            },
            SignalError::Failed { pid, message } => kh_common::Error::SignalFailed { pid, message },
        }
    }
}

/// Sends signals and checks liveness.
pub trait Signaller {
    fn signal(&self, target: &SignalTarget, signal: Signal) -> Result<(), SignalError>;
    fn is_alive(&self, target: &SignalTarget) -> bool;
}

/// What procfs currently says about a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Running,
    /// Exited, or a zombie waiting on its parent.
    Exited,
    /// The PID names a process other than the target.
    Replaced,
}

/// Signaller using `kill(2)`, re-checking the target's identity in procfs
/// before every signal.
#[derive(Debug, Clone)]
pub struct LiveSignaller {
    root: PathBuf,
    info: SystemInfo,
}

impl LiveSignaller {
    /// Signaller over the host's `/proc`. `info` must be the one the
    /// sampler used, so start times compare exactly.
    pub fn new(info: SystemInfo) -> Self {
        Self::with_root("/proc", info)
    }

    pub fn with_root(root: impl Into<PathBuf>, info: SystemInfo) -> Self {
        Self {
            root: root.into(),
            info,
        }
    }

    /// Identity of the process currently holding `pid`, if any.
    pub fn identify(&self, pid: ProcessId) -> Option<SignalTarget> {
        self.observe(pid).map(|(target, _)| target)
    }

    fn observe(&self, pid: ProcessId) -> Option<(SignalTarget, char)> {
        let dir = self.root.join(pid.0.to_string());
        let stat = parse_stat(&fs::read_to_string(dir.join("stat")).ok()?)?;
        let uid = parse_status_uid(&fs::read_to_string(dir.join("status")).ok()?)?;
        let target = SignalTarget {
            pid,
            uid,
            started_at: start_time(&self.info, stat.starttime)?,
        };
        Some((target, stat.state))
    }

    fn liveness(&self, target: &SignalTarget) -> Liveness {
        match self.observe(target.pid) {
            None => Liveness::Exited,
            Some((current, _)) if current != *target => Liveness::Replaced,
            Some((_, 'Z')) => Liveness::Exited,
            Some(_) => Liveness::Running,
        }
    }
}

impl Signaller for LiveSignaller {
    fn signal(&self, target: &SignalTarget, signal: Signal) -> Result<(), SignalError> {
        let pid = target.pid.0;
        match self.liveness(target) {
            Liveness::Exited => return Err(SignalError::NotFound { pid }),
            Liveness::Replaced => return Err(SignalError::Replaced { pid }),
            Liveness::Running => {}
        }

        let result = unsafe { libc::kill(pid as i32, signal.as_raw()) };
        if result == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(SignalError::NotFound { pid }),
            Some(libc::EPERM) => Err(SignalError::PermissionDenied { pid }),
            _ => Err(SignalError::Failed {
                pid,
                message: err.to_string(),
            }),
        }
    }

    fn is_alive(&self, target: &SignalTarget) -> bool {
        self.liveness(target) == Liveness::Running
    }
}

/// Termination timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateConfig {
    /// Grace period after SIGTERM before escalating to SIGKILL.
    pub grace: Duration,
    /// Polling interval while waiting for exit.
    pub poll_interval: Duration,
}

impl Default for TerminateConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// What happened to one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TerminationResult {
    /// Gone, or its PID reused, before SIGTERM reached it.
    AlreadyGone,
    /// Exited within the grace period.
    Terminated,
    /// Survived the grace period and was sent SIGKILL.
    Killed,
    /// Exited between the end of the grace period and SIGKILL.
    ExitedBeforeKill,
    /// A signal could not be delivered.
    Failed { message: String },
}

impl TerminationResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, TerminationResult::Failed { .. })
    }
}

/// Per-process termination record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessTermination {
    pub pid: ProcessId,
    /// Signals actually delivered, in order.
    pub signals: Vec<Signal>,
    pub result: TerminationResult,
}

/// Terminate `targets`: SIGTERM, shared grace period, SIGKILL survivors.
pub fn terminate_all(
    signaller: &dyn Signaller,
    targets: &[SignalTarget],
    config: &TerminateConfig,
) -> Vec<ProcessTermination> {
    let mut records: Vec<ProcessTermination> = Vec::with_capacity(targets.len());
    let mut pending: Vec<usize> = Vec::new();

    for (idx, target) in targets.iter().enumerate() {
        let pid = target.pid;
        let record = match signaller.signal(target, Signal::Term) {
            Ok(()) => {
                debug!(pid = pid.0, "sent SIGTERM");
                pending.push(idx);
                ProcessTermination {
                    pid,
                    signals: vec![Signal::Term],
                    result: TerminationResult::Terminated,
                }
            }
            Err(e) if e.target_gone() => {
                debug!(pid = pid.0, reason = %e, "process already gone");
                ProcessTermination {
                    pid,
                    signals: Vec::new(),
                    result: TerminationResult::AlreadyGone,
                }
            }
            Err(e) => {
                warn!(pid = pid.0, error = %e, "SIGTERM failed");
                ProcessTermination {
                    pid,
                    signals: Vec::new(),
                    result: TerminationResult::Failed {
                        message: e.to_string(),
                    },
                }
            }
        };
        records.push(record);
    }

    if pending.is_empty() {
        return records;
    }

    let deadline = Instant::now() + config.grace;
    loop {
        pending.retain(|&idx| signaller.is_alive(&targets[idx]));
        let now = Instant::now();
        if pending.is_empty() || now >= deadline {
            break;
        }
        thread::sleep(config.poll_interval.min(deadline - now));
    }

    for idx in pending {
        let record = &mut records[idx];
        let pid = record.pid;
        match signaller.signal(&targets[idx], Signal::Kill) {
            Ok(()) => {
                info!(pid = pid.0, "process ignored SIGTERM, sent SIGKILL");
                record.signals.push(Signal::Kill);
                record.result = TerminationResult::Killed;
            }
            Err(e) if e.target_gone() => {
                record.result = TerminationResult::ExitedBeforeKill;
            }
            Err(e) => {
                warn!(pid = pid.0, error = %e, "SIGKILL failed");
                record.result = TerminationResult::Failed {
                    message: e.to_string(),
                };
            }
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Processes that die after a given number of liveness checks.
    #[derive(Default)]
    struct Scripted {
        lives: Mutex<HashMap<u32, u32>>,
        sent: Mutex<Vec<(u32, Signal)>>,
        gone: Vec<u32>,
        pollers: Mutex<HashSet<thread::ThreadId>>,
    }

    impl Signaller for Scripted {
        fn signal(&self, target: &SignalTarget, signal: Signal) -> Result<(), SignalError> {
            let pid = target.pid.0;
            if self.gone.contains(&pid) {
                return Err(SignalError::NotFound { pid });
            }
            self.sent.lock().unwrap().push((pid, signal));
            Ok(())
        }

        fn is_alive(&self, target: &SignalTarget) -> bool {
            self.pollers.lock().unwrap().insert(thread::current().id());
            let mut lives = self.lives.lock().unwrap();
            match lives.get_mut(&target.pid.0) {
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
                None => true,
            }
        }
    }

    fn target(pid: u32) -> SignalTarget {
        SignalTarget {
            pid: ProcessId(pid),
            uid: 1000,
            started_at: DateTime::<Utc>::from_timestamp(1_700_000_123, 0).unwrap(),
        }
    }

    fn targets(pids: impl IntoIterator<Item = u32>) -> Vec<SignalTarget> {
        pids.into_iter().map(target).collect()
    }

    fn fast() -> TerminateConfig {
        TerminateConfig {
            grace: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn cooperative_process_never_gets_sigkill() {
        let signaller = Scripted {
            lives: Mutex::new(HashMap::from([(10, 1)])),
            ..Scripted::default()
        };
        let results = terminate_all(&signaller, &targets([10]), &fast());
        assert_eq!(results[0].result, TerminationResult::Terminated);
        assert_eq!(results[0].signals, vec![Signal::Term]);
        assert_eq!(*signaller.sent.lock().unwrap(), vec![(10, Signal::Term)]);
    }

    #[test]
    fn stubborn_process_always_gets_sigkill() {
        let signaller = Scripted::default();
        let results = terminate_all(&signaller, &targets([11]), &fast());
        assert_eq!(results[0].result, TerminationResult::Killed);
        assert_eq!(results[0].signals, vec![Signal::Term, Signal::Kill]);
    }

    #[test]
    fn already_gone_is_not_a_failure() {
        let signaller = Scripted {
            gone: vec![12],
            ..Scripted::default()
        };
        let results = terminate_all(&signaller, &targets([12]), &fast());
        assert_eq!(results[0].result, TerminationResult::AlreadyGone);
        assert!(!results[0].result.is_failure());
        assert!(signaller.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn grace_is_shared_not_sequential() {
        let signaller = Scripted::default();
        let config = TerminateConfig {
            grace: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        };

        let start = Instant::now();
        let results = terminate_all(&signaller, &targets(20..30), &config);
        let elapsed = start.elapsed();

        assert!(results.iter().all(|r| r.result == TerminationResult::Killed));
        // Ten sequential grace periods would take two seconds.
        assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    }

    #[test]
    fn large_sets_are_polled_from_the_calling_thread() {
        let signaller = Scripted::default();
        let config = TerminateConfig {
            grace: Duration::from_millis(30),
            poll_interval: Duration::from_millis(10),
        };

        let results = terminate_all(&signaller, &targets(2000..4000), &config);

        assert_eq!(results.len(), 2000);
        assert!(results.iter().all(|r| r.result == TerminationResult::Killed));
        let pollers = signaller.pollers.lock().unwrap();
        assert_eq!(*pollers, HashSet::from([thread::current().id()]));
    }

    #[test]
    fn mixed_set_escalates_only_survivors() {
        let signaller = Scripted {
            lives: Mutex::new(HashMap::from([(1, 0)])),
            ..Scripted::default()
        };
        let results = terminate_all(&signaller, &targets([1, 2]), &fast());
        assert_eq!(results[0].result, TerminationResult::Terminated);
        assert_eq!(results[1].result, TerminationResult::Killed);
    }

    const STAT: &str = "4242 (stress) S 1 4242 4242 0 -1 4194304 \
        1200 0 0 0 250 50 0 0 20 0 4 0 12300 987654321 2560 18446744073709551615 \
        1 1 0 0 0 0 0 16781312 134234626 0 0 0 17 3 0 0 0 0 0";

    fn fake_info() -> SystemInfo {
        SystemInfo {
            clk_tck: 100,
            page_size: 4096,
            mem_total_bytes: 4096 * 10_000,
            boot_time: 1_700_000_000,
        }
    }

    fn fake_proc(stat: &str, uid: u32) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("4242");
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(proc_dir.join("stat"), stat).unwrap();
        fs::write(
            proc_dir.join("status"),
            format!("Name:\tstress\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\n"),
        )
        .unwrap();
        dir
    }

    fn sampled() -> SignalTarget {
        SignalTarget {
            pid: ProcessId(4242),
            uid: 1000,
            // btime plus 12300 ticks at 100 Hz.
            started_at: DateTime::<Utc>::from_timestamp(1_700_000_123, 0).unwrap(),
        }
    }

    #[test]
    fn matching_identity_is_alive() {
        let dir = fake_proc(STAT, 1000);
        let signaller = LiveSignaller::with_root(dir.path(), fake_info());
        assert_eq!(signaller.identify(ProcessId(4242)), Some(sampled()));
        assert!(signaller.is_alive(&sampled()));
    }

    #[test]
    fn reused_pid_is_never_signalled() {
        let dir = fake_proc(&STAT.replace(" 12300 ", " 99900 "), 1000);
        let signaller = LiveSignaller::with_root(dir.path(), fake_info());
        assert!(!signaller.is_alive(&sampled()));
        assert_eq!(
            signaller.signal(&sampled(), Signal::Term),
            Err(SignalError::Replaced { pid: 4242 })
        );

        let results = terminate_all(&signaller, &[sampled()], &fast());
        assert_eq!(results[0].result, TerminationResult::AlreadyGone);
        assert!(results[0].signals.is_empty());
    }

    #[test]
    fn pid_taken_by_another_user_is_never_signalled() {
        let dir = fake_proc(STAT, 0);
        let signaller = LiveSignaller::with_root(dir.path(), fake_info());
        assert_eq!(
            signaller.signal(&sampled(), Signal::Kill),
            Err(SignalError::Replaced { pid: 4242 })
        );
    }

    #[test]
    fn zombie_counts_as_exited() {
        let dir = fake_proc(&STAT.replace("(stress) S", "(stress) Z"), 1000);
        let signaller = LiveSignaller::with_root(dir.path(), fake_info());
        assert!(!signaller.is_alive(&sampled()));
        assert_eq!(
            signaller.signal(&sampled(), Signal::Term),
            Err(SignalError::NotFound { pid: 4242 })
        );
    }

    #[test]
    fn live_signaller_reports_missing_pid() {
        let info = SystemInfo::read(std::path::Path::new("/proc")).expect("read /proc");
        let signaller = LiveSignaller::new(info);
        let missing = SignalTarget {
            pid: ProcessId(999_999_999),
            ..sampled()
        };
        assert!(!signaller.is_alive(&missing));
        assert_eq!(
            signaller.signal(&missing, Signal::Term),
            Err(SignalError::NotFound { pid: 999_999_999 })
        );
    }

    #[test]
    fn live_signaller_sees_self_alive() {
        let info = SystemInfo::read(std::path::Path::new("/proc")).expect("read /proc");
        let signaller = LiveSignaller::new(info);
        let me = signaller
            .identify(ProcessId(std::process::id()))
            .expect("own process");
        assert!(signaller.is_alive(&me));
    }
}
