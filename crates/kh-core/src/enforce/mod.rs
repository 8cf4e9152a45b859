//! Enforcement: the on-demand gate, offender notification, and termination.
//!
//! Per violating account the controller composes a report, logs it, and
//! (unless dry-run) notifies the offender before terminating the account's
//! sampled processes. Notification always completes, successfully or not,
//! before the first signal is sent.

pub mod flag;
pub mod report;
pub mod signal;

pub use flag::{FileRequestFlag, FlagError, RequestFlag};
pub use report::compose_report;
pub use signal::{
    terminate_all, LiveSignaller, ProcessTermination, Signal, SignalError, SignalTarget,
    Signaller, TerminateConfig, TerminationResult,
};

use crate::logging::event_names;
use crate::notify::{DeliverySummary, NotificationDispatcher};
use crate::policy::Violation;
use kh_common::Account;
use serde::Serialize;
use tracing::{debug, info};

/// Result of the on-demand gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// A request was pending and has been consumed.
    Open,
    /// On-demand mode with no pending request. Nothing may happen.
    Closed,
    /// Continuous mode; no gate applies.
    NotGated,
}

impl GateState {
    pub fn allows_enforcement(self) -> bool {
        !matches!(self, GateState::Closed)
    }
}

/// Mode switches for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnforcementConfig {
    /// Log reports only: no notification, no signals.
    pub dry_run: bool,
    /// Act only when a request flag is pending.
    pub on_demand: bool,
    /// Include GPU minutes in reports.
    pub gpu_enabled: bool,
    pub terminate: TerminateConfig,
}

/// What happened to one violating account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountOutcome {
    pub account: Account,
    pub report: String,
    /// `None` in dry-run.
    pub delivery: Option<DeliverySummary>,
    pub terminations: Vec<ProcessTermination>,
}

/// Result of enforcing one run's violations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnforcementOutcome {
    pub accounts: Vec<AccountOutcome>,
}

impl EnforcementOutcome {
    pub fn signals_sent(&self) -> usize {
        self.accounts
            .iter()
            .flat_map(|a| &a.terminations)
            .map(|t| t.signals.len())
            .sum()
    }

    /// Processes that received at least one signal.
    pub fn processes_signalled(&self) -> usize {
        self.accounts
            .iter()
            .flat_map(|a| &a.terminations)
            .filter(|t| !t.signals.is_empty())
            .count()
    }

    /// Failed signal deliveries plus failed notification channels.
    pub fn failures(&self) -> usize {
        self.accounts
            .iter()
            .map(|a| {
                let signal_failures = a
                    .terminations
                    .iter()
                    .filter(|t| t.result.is_failure())
                    .count();
                let delivery_failures = a.delivery.as_ref().map_or(0, |d| d.failures());
                signal_failures + delivery_failures
            })
            .sum()
    }
}

/// Drives the gate, notification, and termination.
pub struct EnforcementController<'a> {
    config: EnforcementConfig,
    flag: &'a dyn RequestFlag,
    signaller: &'a dyn Signaller,
    dispatcher: NotificationDispatcher<'a>,
}

impl<'a> EnforcementController<'a> {
    pub fn new(
        config: EnforcementConfig,
        flag: &'a dyn RequestFlag,
        signaller: &'a dyn Signaller,
        dispatcher: NotificationDispatcher<'a>,
    ) -> Self {
        Self {
            config,
            flag,
            signaller,
            dispatcher,
        }
    }

    pub fn config(&self) -> &EnforcementConfig {
        &self.config
    }

    /// Check, and in on-demand mode consume, the request flag.
    ///
    /// A closed gate consumes nothing.
    pub fn gate(&self) -> Result<GateState, FlagError> {
        if !self.config.on_demand {
            return Ok(GateState::NotGated);
        }
        if self.flag.consume()? {
            info!(target: event_names::ENFORCE_GATE_OPENED, "enforcement request consumed");
            Ok(GateState::Open)
        } else {
            info!(target: event_names::ENFORCE_GATE_CLOSED, "no enforcement request pending");
            Ok(GateState::Closed)
        }
    }

    /// Notify and terminate every violating account.
    pub fn enforce(&self, violations: &[Violation]) -> EnforcementOutcome {
        let accounts = violations
            .iter()
            .map(|violation| self.enforce_account(violation))
            .collect();
        EnforcementOutcome { accounts }
    }

    fn enforce_account(&self, violation: &Violation) -> AccountOutcome {
        let report = compose_report(violation, self.config.gpu_enabled);
        info!(
            target: event_names::ENFORCE_REPORT,
            account = %violation.account,
            dry_run = self.config.dry_run,
            "{report}"
        );

        if self.config.dry_run {
            return AccountOutcome {
                account: violation.account.clone(),
                report,
                delivery: None,
                terminations: Vec::new(),
            };
        }

        let delivery = self.dispatcher.dispatch(&violation.account, &report);

        let targets: Vec<SignalTarget> = violation
            .usage
            .processes
            .iter()
            .map(SignalTarget::from)
            .collect();
        debug!(account = %violation.account, count = targets.len(), "terminating processes");
        let terminations = terminate_all(self.signaller, &targets, &self.config.terminate);

        let killed = terminations
            .iter()
            .filter(|t| t.result == TerminationResult::Killed)
            .count();
        info!(
            target: event_names::ENFORCE_TERMINATED,
            account = %violation.account,
            processes = terminations.len(),
            escalated = killed,
            "processes terminated"
        );

        AccountOutcome {
            account: violation.account.clone(),
            report,
            delivery: Some(delivery),
            terminations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AccountAggregate;
    use crate::collect::ProcessRecord;
    use crate::notify::{
        MailDirectory, Mailer, NotifyConfig, NotifyError, TerminalSink, WebhookClient,
        WebhookPayload,
    };
    use crate::policy::{ExceededLimit, LimitKind};
    use chrono::Utc;
    use kh_common::ProcessId;
    use std::cell::{Cell, RefCell};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records the order of notification and signal events.
    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl TerminalSink for Journal {
        fn active_terminals(&self, _account: &Account) -> Result<Vec<String>, NotifyError> {
            Ok(vec!["pts/1".to_string()])
        }
        fn write(&self, account: &Account, tty: &str, _text: &str) -> Result<(), NotifyError> {
            self.push(format!("write {account} {tty}"));
            Ok(())
        }
    }

    impl WebhookClient for Journal {
        fn post(&self, _url: &str, _payload: &WebhookPayload) -> Result<u16, NotifyError> {
            Ok(200)
        }
    }

    impl MailDirectory for Journal {
        fn resolve_email(&self, _account: &Account) -> Option<String> {
            None
        }
    }

    impl Mailer for Journal {
        fn send(&self, _from: &str, _to: &str, _body: &str, _port: u16) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    impl Signaller for Journal {
        fn signal(&self, target: &SignalTarget, signal: Signal) -> Result<(), SignalError> {
            self.push(format!("{signal} {}", target.pid));
            Ok(())
        }
        fn is_alive(&self, _target: &SignalTarget) -> bool {
            false
        }
    }

    struct MemoryFlag {
        pending: Cell<bool>,
        consumed: RefCell<u32>,
    }

    impl MemoryFlag {
        fn new(pending: bool) -> Self {
            Self {
                pending: Cell::new(pending),
                consumed: RefCell::new(0),
            }
        }
    }

    impl RequestFlag for MemoryFlag {
        fn exists(&self) -> bool {
            self.pending.get()
        }
        fn consume(&self) -> Result<bool, FlagError> {
            let was = self.pending.replace(false);
            if was {
                *self.consumed.borrow_mut() += 1;
            }
            Ok(was)
        }
        fn create(&self) -> Result<(), FlagError> {
            self.pending.set(true);
            Ok(())
        }
    }

    fn violation(account: &str, pids: &[u32]) -> Violation {
        let processes = pids
            .iter()
            .map(|&pid| ProcessRecord {
                pid: ProcessId(pid),
                uid: 1000,
                owner: Account::new(account),
                name: "stress".to_string(),
                cpu_percent: 100.0,
                memory_percent: 1.0,
                created_at: Utc::now(),
                gpu_attached: false,
            })
            .collect::<Vec<_>>();
        Violation {
            account: Account::new(account),
            exceeded: vec![ExceededLimit {
                kind: LimitKind::Cpu,
                observed: 100.0 * pids.len() as f64,
                threshold: 9.5,
            }],
            usage: AccountAggregate {
                cpu_percent_total: 100.0 * pids.len() as f64,
                memory_percent_total: pids.len() as f64,
                gpu_wall_minutes: 0.0,
                processes,
            },
        }
    }

    fn config(dry_run: bool, on_demand: bool) -> EnforcementConfig {
        EnforcementConfig {
            dry_run,
            on_demand,
            gpu_enabled: false,
            terminate: TerminateConfig {
                grace: Duration::from_millis(50),
                poll_interval: Duration::from_millis(5),
            },
        }
    }

    fn dispatcher(journal: &Journal) -> NotificationDispatcher<'_> {
        NotificationDispatcher::new(
            NotifyConfig {
                terminal_warning: "warning".to_string(),
                ..NotifyConfig::default()
            },
            journal,
            journal,
            journal,
            journal,
        )
    }

    #[test]
    fn continuous_mode_is_not_gated() {
        let journal = Journal::default();
        let flag = MemoryFlag::new(true);
        let controller =
            EnforcementController::new(config(false, false), &flag, &journal, dispatcher(&journal));
        assert_eq!(controller.gate().unwrap(), GateState::NotGated);
        // The flag belongs to on-demand runs and is left alone.
        assert!(flag.exists());
    }

    #[test]
    fn on_demand_gate_is_one_shot() {
        let journal = Journal::default();
        let flag = MemoryFlag::new(false);
        let controller =
            EnforcementController::new(config(false, true), &flag, &journal, dispatcher(&journal));

        assert_eq!(controller.gate().unwrap(), GateState::Closed);
        assert!(!GateState::Closed.allows_enforcement());

        flag.create().unwrap();
        assert_eq!(controller.gate().unwrap(), GateState::Open);
        assert_eq!(controller.gate().unwrap(), GateState::Closed);
        assert_eq!(*flag.consumed.borrow(), 1);
    }

    #[test]
    fn notification_precedes_termination() {
        let journal = Journal::default();
        let flag = MemoryFlag::new(false);
        let controller =
            EnforcementController::new(config(false, false), &flag, &journal, dispatcher(&journal));

        let outcome = controller.enforce(&[violation("p100001", &[41, 42])]);

        assert_eq!(
            journal.events(),
            vec!["write p100001 pts/1", "SIGTERM 41", "SIGTERM 42"]
        );
        assert_eq!(outcome.signals_sent(), 2);
        assert_eq!(outcome.processes_signalled(), 2);
        assert_eq!(outcome.failures(), 0);
        let account = &outcome.accounts[0];
        assert!(account.report.starts_with("User p100001 uses"));
        assert_eq!(account.delivery.as_ref().unwrap().terminals_written, 1);
    }

    #[test]
    fn dry_run_sends_nothing() {
        let journal = Journal::default();
        let flag = MemoryFlag::new(false);
        let controller =
            EnforcementController::new(config(true, false), &flag, &journal, dispatcher(&journal));

        let outcome = controller.enforce(&[violation("p100001", &[41]), violation("p100002", &[7])]);

        assert!(journal.events().is_empty());
        assert_eq!(outcome.signals_sent(), 0);
        assert_eq!(outcome.accounts.len(), 2);
        assert!(outcome.accounts.iter().all(|a| a.delivery.is_none()));
        assert!(outcome.accounts[1].report.contains("p100002 pid 7 stress"));
    }
}
