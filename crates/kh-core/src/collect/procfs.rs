//! Live process source backed by `/proc`.
//!
//! # Data Sources
//! - `/proc/[pid]/stat`: comm, utime, stime, starttime, rss
//! - `/proc/[pid]/status`: real UID
//! - `/proc/meminfo`: MemTotal
//! - `/proc/stat`: btime
//! - System CLK_TCK and page size via sysconf
//!
//! Every handle remembers the `starttime` it was discovered with. If a later
//! read sees a different value the PID has been reused by another process,
//! and the handle reports [`Reading::Vanished`].

use super::source::{CollectError, ProcessHandle, ProcessSource};
use super::types::Reading;
use super::users::UserCache;
use chrono::{DateTime, Utc};
use kh_common::{Account, ProcessId};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// System clock ticks per second.
/// On Linux, typically 100 (USER_HZ).
pub fn clk_tck() -> u64 {
    static CLK_TCK: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if tck > 0 {
            tck as u64
        } else {
            100
        }
    })
}

/// Memory page size in bytes.
pub fn page_size() -> u64 {
    static PAGE_SIZE: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            4096
        }
    })
}

/// Host-wide constants needed to turn raw `/proc` counters into percentages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemInfo {
    pub clk_tck: u64,
    pub page_size: u64,
    pub mem_total_bytes: u64,
    /// Boot time, seconds since the Unix epoch.
    pub boot_time: i64,
}

impl SystemInfo {
    /// Read system constants from a procfs mount.
    pub fn read(root: &Path) -> Result<Self, CollectError> {
        let meminfo_path = root.join("meminfo");
        let meminfo = read_file(&meminfo_path)?;
        let mem_total_kb = parse_meminfo_total_kb(&meminfo).ok_or_else(|| CollectError::Parse {
            path: meminfo_path.clone(),
            message: "missing MemTotal".to_string(),
        })?;

        let stat_path = root.join("stat");
        let stat = read_file(&stat_path)?;
        let boot_time = parse_btime(&stat).ok_or_else(|| CollectError::Parse {
            path: stat_path.clone(),
            message: "missing btime".to_string(),
        })?;

        Ok(SystemInfo {
            clk_tck: clk_tck(),
            page_size: page_size(),
            mem_total_bytes: mem_total_kb * 1024,
            boot_time,
        })
    }
}

fn read_file(path: &Path) -> Result<String, CollectError> {
    fs::read_to_string(path).map_err(|source| CollectError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_meminfo_total_kb(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

fn parse_btime(content: &str) -> Option<i64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// The fields of `/proc/[pid]/stat` the sampler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFields {
    pub comm: String,
    /// Scheduler state (`R`, `S`, `Z`, ...).
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
    /// Resident set size in pages.
    pub rss_pages: u64,
}

/// Parse `/proc/[pid]/stat`.
///
/// Format: `pid (comm) state ppid ...`. The comm may itself contain spaces
/// and parentheses, so fields are located relative to the last `)`.
pub fn parse_stat(content: &str) -> Option<StatFields> {
    let comm_start = content.find('(')?;
    let comm_end = content.rfind(')')?;
    let comm = content.get(comm_start + 1..comm_end)?.to_string();
    let after_comm = content.get(comm_end + 2..)?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();

    // Indices are 0-based from the state field.
    Some(StatFields {
        comm,
        state: fields.first()?.chars().next()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        starttime: fields.get(19)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

/// Wall-clock start of a process from its `starttime` ticks since boot.
pub fn start_time(info: &SystemInfo, start_ticks: u64) -> Option<DateTime<Utc>> {
    let millis =
        info.boot_time * 1000 + (start_ticks.saturating_mul(1000) / info.clk_tck.max(1)) as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Parse the real UID from `/proc/[pid]/status`.
pub fn parse_status_uid(content: &str) -> Option<u32> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// Enumerates processes from a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    root: PathBuf,
    info: Arc<SystemInfo>,
    users: UserCache,
}

impl ProcfsSource {
    /// Source over the host's `/proc`.
    pub fn new() -> Result<Self, CollectError> {
        let root = PathBuf::from("/proc");
        let info = SystemInfo::read(&root)?;
        Ok(Self::with_root(root, info))
    }

    /// Source over an arbitrary procfs-shaped directory.
    pub fn with_root(root: impl Into<PathBuf>, info: SystemInfo) -> Self {
        Self {
            root: root.into(),
            info: Arc::new(info),
            users: UserCache::new(),
        }
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.info
    }
}

impl ProcessSource for ProcfsSource {
    fn list_processes(&self) -> Result<Vec<Box<dyn ProcessHandle>>, CollectError> {
        let entries = fs::read_dir(&self.root).map_err(|source| CollectError::Read {
            path: self.root.clone(),
            source,
        })?;

        let mut handles: Vec<Box<dyn ProcessHandle>> = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };

            let dir = entry.path();
            match fs::read_to_string(dir.join("stat"))
                .ok()
                .and_then(|content| parse_stat(&content))
            {
                Some(stat) => handles.push(Box::new(ProcfsHandle {
                    pid: ProcessId(pid),
                    dir,
                    start_ticks: stat.starttime,
                    info: Arc::clone(&self.info),
                    users: self.users.clone(),
                    last_cpu: None,
                    uid: None,
                })),
                None => trace!(pid, "process exited during enumeration"),
            }
        }

        handles.sort_by_key(|h| h.pid());
        Ok(handles)
    }
}

/// One process under `/proc`.
#[derive(Debug)]
pub struct ProcfsHandle {
    pid: ProcessId,
    dir: PathBuf,
    start_ticks: u64,
    info: Arc<SystemInfo>,
    users: UserCache,
    last_cpu: Option<(Instant, u64)>,
    uid: Option<u32>,
}

impl ProcfsHandle {
    /// Read and identity-check the stat file.
    fn read_stat(&self) -> Reading<StatFields> {
        let content = match fs::read_to_string(self.dir.join("stat")) {
            Ok(content) => content,
            Err(e) => return Reading::from_io_error(&e),
        };
        match parse_stat(&content) {
            Some(stat) if stat.starttime == self.start_ticks => Reading::Ok(stat),
            Some(_) => {
                trace!(pid = self.pid.0, "pid reused since discovery");
                Reading::Vanished
            }
            None => Reading::Vanished,
        }
    }
}

impl ProcessHandle for ProcfsHandle {
    fn pid(&self) -> ProcessId {
        self.pid
    }

    fn cpu_percent(&mut self) -> Reading<f64> {
        let stat = match self.read_stat() {
            Reading::Ok(stat) => stat,
            Reading::Vanished => return Reading::Vanished,
            Reading::PermissionDenied => return Reading::PermissionDenied,
        };
        let now = Instant::now();
        let ticks = stat.utime + stat.stime;

        let percent = match self.last_cpu {
            None => 0.0,
            Some((then, prev_ticks)) => {
                let elapsed = now.duration_since(then).as_secs_f64();
                if elapsed <= 0.0 {
                    0.0
                } else {
                    let cpu_secs = ticks.saturating_sub(prev_ticks) as f64 / self.info.clk_tck as f64;
                    cpu_secs / elapsed * 100.0
                }
            }
        };
        self.last_cpu = Some((now, ticks));
        Reading::Ok(percent)
    }

    fn memory_percent(&mut self) -> Reading<f64> {
        if self.info.mem_total_bytes == 0 {
            return Reading::Ok(0.0);
        }
        self.read_stat().map(|stat| {
            let rss_bytes = stat.rss_pages.saturating_mul(self.info.page_size);
            rss_bytes as f64 / self.info.mem_total_bytes as f64 * 100.0
        })
    }

    fn uid(&mut self) -> Reading<u32> {
        if let Some(uid) = self.uid {
            return Reading::Ok(uid);
        }
        let content = match fs::read_to_string(self.dir.join("status")) {
            Ok(content) => content,
            Err(e) => return Reading::from_io_error(&e),
        };
        match parse_status_uid(&content) {
            Some(uid) => {
                self.uid = Some(uid);
                Reading::Ok(uid)
            }
            None => Reading::Vanished,
        }
    }

    fn owner(&mut self) -> Reading<Account> {
        let users = self.users.clone();
        self.uid().map(|uid| users.resolve(uid))
    }

    fn name(&mut self) -> Reading<String> {
        self.read_stat().map(|stat| stat.comm)
    }

    fn created_at(&mut self) -> Reading<DateTime<Utc>> {
        match start_time(&self.info, self.start_ticks) {
            Some(ts) => Reading::Ok(ts),
            None => Reading::Vanished,
        }
    }
}
