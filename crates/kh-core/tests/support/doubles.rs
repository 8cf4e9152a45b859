//! In-memory collaborators that record what a run did.

#![allow(dead_code)]
// Test support intentionally provides more helpers than any single test uses.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kh_common::{Account, ProcessId};
use kh_core::collect::{CollectError, GpuSource, ProcessHandle, ProcessSource, Reading};
use kh_core::enforce::{FileRequestFlag, Signal, SignalError, SignalTarget, Signaller};
use kh_core::notify::{MailDirectory, Mailer, NotifyError, TerminalSink, WebhookClient, WebhookPayload};
use kh_core::run::Collaborators;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// A process as the source will report it.
#[derive(Debug, Clone)]
pub struct MockProcess {
    pub pid: u32,
    pub uid: u32,
    pub owner: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub created_at: DateTime<Utc>,
    /// Exits between the prime read and the measurement.
    pub vanishes: bool,
}

impl MockProcess {
    pub fn new(pid: u32, uid: u32, owner: &str, cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            pid,
            uid,
            owner: owner.to_string(),
            name: "python".to_string(),
            cpu_percent,
            memory_percent,
            created_at: Utc::now() - ChronoDuration::minutes(5),
            vanishes: false,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn started_minutes_ago(mut self, minutes: i64) -> Self {
        self.created_at = Utc::now() - ChronoDuration::minutes(minutes);
        self
    }

    pub fn vanishing(mut self) -> Self {
        self.vanishes = true;
        self
    }
}

struct MockHandle {
    process: MockProcess,
    primed: bool,
}

impl MockHandle {
    fn live<T>(&self, value: T) -> Reading<T> {
        if self.process.vanishes && self.primed {
            Reading::Vanished
        } else {
            Reading::Ok(value)
        }
    }
}

impl ProcessHandle for MockHandle {
    fn pid(&self) -> ProcessId {
        ProcessId(self.process.pid)
    }

    fn cpu_percent(&mut self) -> Reading<f64> {
        if !self.primed {
            self.primed = true;
            return Reading::Ok(0.0);
        }
        self.live(self.process.cpu_percent)
    }

    fn memory_percent(&mut self) -> Reading<f64> {
        self.live(self.process.memory_percent)
    }

    fn uid(&mut self) -> Reading<u32> {
        self.live(self.process.uid)
    }

    fn owner(&mut self) -> Reading<Account> {
        self.live(Account::new(self.process.owner.clone()))
    }

    fn name(&mut self) -> Reading<String> {
        self.live(self.process.name.clone())
    }

    fn created_at(&mut self) -> Reading<DateTime<Utc>> {
        self.live(self.process.created_at)
    }
}

/// Process table that hands out fresh handles on every listing.
#[derive(Default)]
pub struct MockProcessSource {
    pub processes: Vec<MockProcess>,
    listings: AtomicUsize,
}

impl MockProcessSource {
    pub fn new(processes: Vec<MockProcess>) -> Self {
        Self {
            processes,
            listings: AtomicUsize::new(0),
        }
    }

    /// How many times the process table was enumerated.
    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

impl ProcessSource for MockProcessSource {
    fn list_processes(&self) -> Result<Vec<Box<dyn ProcessHandle>>, CollectError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .processes
            .iter()
            .cloned()
            .map(|process| {
                Box::new(MockHandle {
                    process,
                    primed: false,
                }) as Box<dyn ProcessHandle>
            })
            .collect())
    }
}

/// GPU source with a fixed PID set.
#[derive(Default)]
pub struct MockGpu(pub HashSet<u32>);

impl GpuSource for MockGpu {
    fn attached_pids(&self) -> HashSet<u32> {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Processes exit on SIGTERM unless listed as stubborn.
#[derive(Default)]
pub struct RecordingSignaller {
    pub stubborn: HashSet<u32>,
    sent: Mutex<Vec<(u32, Signal)>>,
    terminated: Mutex<HashSet<u32>>,
}

impl RecordingSignaller {
    pub fn with_stubborn(pids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            stubborn: pids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(u32, Signal)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, signal: Signal) -> usize {
        self.sent().iter().filter(|(_, s)| *s == signal).count()
    }

    pub fn signalled_pids(&self) -> HashSet<u32> {
        self.sent().into_iter().map(|(pid, _)| pid).collect()
    }
}

impl Signaller for RecordingSignaller {
    fn signal(&self, target: &SignalTarget, signal: Signal) -> Result<(), SignalError> {
        let pid = target.pid.0;
        self.sent.lock().unwrap().push((pid, signal));
        if signal == Signal::Kill || !self.stubborn.contains(&pid) {
            self.terminated.lock().unwrap().insert(pid);
        }
        Ok(())
    }

    fn is_alive(&self, target: &SignalTarget) -> bool {
        !self.terminated.lock().unwrap().contains(&target.pid.0)
    }
}

// ---------------------------------------------------------------------------
// Notification channels
// ---------------------------------------------------------------------------

/// Every account has one session on `pts/0`.
#[derive(Default)]
pub struct RecordingTerminals {
    writes: Mutex<Vec<(String, String, String)>>,
}

impl RecordingTerminals {
    pub fn writes(&self) -> Vec<(String, String, String)> {
        self.writes.lock().unwrap().clone()
    }
}

impl TerminalSink for RecordingTerminals {
    fn active_terminals(&self, _account: &Account) -> Result<Vec<String>, NotifyError> {
        Ok(vec!["pts/0".to_string()])
    }

    fn write(&self, account: &Account, tty: &str, text: &str) -> Result<(), NotifyError> {
        self.writes
            .lock()
            .unwrap()
            .push((account.to_string(), tty.to_string(), text.to_string()));
        Ok(())
    }
}

/// Webhook that records posts and answers with a fixed status.
pub struct RecordingWebhook {
    pub status: u16,
    posts: Mutex<Vec<(String, WebhookPayload)>>,
}

impl Default for RecordingWebhook {
    fn default() -> Self {
        Self {
            status: 200,
            posts: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingWebhook {
    pub fn failing(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn posts(&self) -> Vec<(String, WebhookPayload)> {
        self.posts.lock().unwrap().clone()
    }
}

impl WebhookClient for RecordingWebhook {
    fn post(&self, url: &str, payload: &WebhookPayload) -> Result<u16, NotifyError> {
        self.posts
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        if (200..300).contains(&self.status) {
            Ok(self.status)
        } else {
            Err(NotifyError::HttpStatus {
                status: self.status,
            })
        }
    }
}

/// Address book keyed by account name.
#[derive(Default)]
pub struct MapDirectory(pub HashMap<String, String>);

impl MailDirectory for MapDirectory {
    fn resolve_email(&self, account: &Account) -> Option<String> {
        self.0.get(account.as_str()).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub from: String,
    pub to: String,
    pub body: String,
    pub port: u16,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, from: &str, to: &str, body: &str, port: u16) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(SentMail {
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            port,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// A full set of doubles around a fake process table.
pub struct World {
    pub source: MockProcessSource,
    pub gpu: MockGpu,
    pub flag: FileRequestFlag,
    pub signaller: RecordingSignaller,
    pub terminals: RecordingTerminals,
    pub webhook: RecordingWebhook,
    pub directory: MapDirectory,
    pub mailer: RecordingMailer,
}

impl World {
    pub fn new(processes: Vec<MockProcess>, flag_path: &Path) -> Self {
        Self {
            source: MockProcessSource::new(processes),
            gpu: MockGpu::default(),
            flag: FileRequestFlag::new(flag_path),
            signaller: RecordingSignaller::default(),
            terminals: RecordingTerminals::default(),
            webhook: RecordingWebhook::default(),
            directory: MapDirectory::default(),
            mailer: RecordingMailer::default(),
        }
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            source: &self.source,
            gpu: &self.gpu,
            flag: &self.flag,
            signaller: &self.signaller,
            terminals: &self.terminals,
            webhook: &self.webhook,
            directory: &self.directory,
            mailer: &self.mailer,
        }
    }
}

/// Ten processes at 5.5 % memory and 10 % CPU, each under its own account.
pub fn ten_moderate_processes() -> Vec<MockProcess> {
    (0..10)
        .map(|i| MockProcess::new(2000 + i, 1000 + i, &format!("p10000{i}"), 10.0, 5.5))
        .collect()
}
