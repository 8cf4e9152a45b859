//! One enforcement run: gate, sample, aggregate, evaluate, enforce.
//!
//! A run holds no state between invocations apart from the request flag;
//! an external scheduler (cron, a systemd timer) re-invokes the binary.

use crate::aggregate::aggregate;
use crate::collect::{
    CollectError, GpuSource, NvidiaSmi, ProcessSource, ProcfsSource, ToolRunner,
};
use crate::enforce::{
    EnforcementConfig, EnforcementController, FileRequestFlag, FlagError, GateState,
    LiveSignaller, RequestFlag, Signaller, TerminateConfig,
};
use crate::exit_codes::ExitCode;
use crate::logging::{event_names, generate_run_id, Stage};
use crate::notify::{
    FingerDirectory, MailDirectory, MailSettings, Mailer, NotificationDispatcher, NotifyConfig,
    SmtpMailer, TerminalSink, UreqWebhookClient, WebhookClient, WebhookTarget, WriteTerminalSink,
};
use crate::policy::{evaluate, Thresholds};
use crate::sample::{DropCounts, Sampler, SamplerConfig};
use chrono::Utc;
use kh_common::Account;
use kh_config::{Settings, ValidationError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, info_span, warn};

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ValidationError),

    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error(transparent)]
    Collect(#[from] CollectError),
}

impl RunError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RunError::Config(_) => ExitCode::ConfigError,
            RunError::Flag(e) if e.is_permission_denied() => ExitCode::PermissionError,
            RunError::Flag(_) | RunError::Collect(_) => ExitCode::IoError,
        }
    }
}

impl From<RunError> for kh_common::Error {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Config(e) => e.into(),
            RunError::Flag(e) => e.into(),
            RunError::Collect(e) => e.into(),
        }
    }
}

/// Everything a run talks to outside the process.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub source: &'a dyn ProcessSource,
    pub gpu: &'a dyn GpuSource,
    pub flag: &'a dyn RequestFlag,
    pub signaller: &'a dyn Signaller,
    pub terminals: &'a dyn TerminalSink,
    pub webhook: &'a dyn WebhookClient,
    pub directory: &'a dyn MailDirectory,
    pub mailer: &'a dyn Mailer,
}

/// Production collaborators.
pub struct LiveCollaborators {
    source: ProcfsSource,
    gpu: NvidiaSmi,
    flag: FileRequestFlag,
    signaller: LiveSignaller,
    terminals: WriteTerminalSink,
    webhook: UreqWebhookClient,
    directory: FingerDirectory,
    mailer: SmtpMailer,
}

impl LiveCollaborators {
    pub fn from_settings(settings: &Settings) -> Result<Self, CollectError> {
        let timeout = Duration::from_secs(settings.collaborator_timeout_secs);
        let runner = ToolRunner::with_timeout(timeout);
        let source = ProcfsSource::new()?;
        let signaller = LiveSignaller::new(*source.system_info());
        Ok(Self {
            source,
            gpu: NvidiaSmi::new(runner.clone()),
            flag: FileRequestFlag::new(&settings.request_flag_path),
            signaller,
            terminals: WriteTerminalSink::new(runner.clone()),
            webhook: UreqWebhookClient::new(timeout),
            directory: FingerDirectory::new(runner),
            mailer: SmtpMailer::new(timeout),
        })
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

/// What one run saw and did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub gate: GateState,
    pub dry_run: bool,
    /// Processes listed at the start of sampling.
    pub scanned: usize,
    pub dropped: DropCounts,
    /// Accounts with at least one sampled process.
    pub accounts: usize,
    pub violators: Vec<Account>,
    pub signals_sent: usize,
    pub processes_signalled: usize,
    /// Failed signals plus failed notification channels.
    pub failures: usize,
}

impl RunSummary {
    fn gated(run_id: String, dry_run: bool) -> Self {
        Self {
            run_id,
            gate: GateState::Closed,
            dry_run,
            scanned: 0,
            dropped: DropCounts::default(),
            accounts: 0,
            violators: Vec::new(),
            signals_sent: 0,
            processes_signalled: 0,
            failures: 0,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.violators.is_empty() {
            ExitCode::Clean
        } else if self.dry_run {
            ExitCode::ViolationsReported
        } else if self.failures > 0 {
            ExitCode::PartialFail
        } else {
            ExitCode::Enforced
        }
    }
}

/// Notification channels enabled by `settings`.
pub fn notify_config(settings: &Settings) -> NotifyConfig {
    let webhook = if settings.slack {
        settings.slack_url.clone().map(|url| WebhookTarget {
            url,
            identity: settings.webhook.clone(),
        })
    } else {
        None
    };
    let mail = if settings.email {
        settings.from_address.clone().map(|from| MailSettings {
            from,
            port: settings.mail_server_port,
            body: if settings.request_only {
                settings.mail_body_request_only.clone()
            } else {
                settings.mail_body.clone()
            },
        })
    } else {
        None
    };
    NotifyConfig {
        terminal_warning: settings.terminal_warning.clone(),
        webhook,
        mail,
    }
}

/// Execute one run against `collaborators`.
///
/// In on-demand mode the gate is checked before sampling, so a closed gate
/// costs no sampling work and touches nothing.
pub fn run_once(
    settings: &Settings,
    collaborators: Collaborators<'_>,
) -> Result<RunSummary, RunError> {
    let run_id = generate_run_id();
    let span = info_span!("run", run_id = %run_id);
    let _enter = span.enter();

    info!(
        target: event_names::RUN_STARTED,
        stage = %Stage::Init,
        dry_run = settings.dummy,
        request_only = settings.request_only,
        email = settings.email,
        slack = settings.slack,
        "run started"
    );

    let sampler_config = SamplerConfig::from_settings(settings)?;
    let thresholds = Thresholds::from_settings(settings);
    let dispatcher = NotificationDispatcher::new(
        notify_config(settings),
        collaborators.terminals,
        collaborators.webhook,
        collaborators.directory,
        collaborators.mailer,
    );
    let controller = EnforcementController::new(
        EnforcementConfig {
            dry_run: settings.dummy,
            on_demand: settings.request_only,
            gpu_enabled: thresholds.gpu_enabled(),
            terminate: TerminateConfig::default(),
        },
        collaborators.flag,
        collaborators.signaller,
        dispatcher,
    );

    let gate = controller.gate()?;
    if !gate.allows_enforcement() {
        let summary = RunSummary::gated(run_id, settings.dummy);
        info!(target: event_names::RUN_FINISHED, stage = %Stage::Gate, "run finished, gate closed");
        return Ok(summary);
    }

    let sample = Sampler::new(collaborators.source, collaborators.gpu, sampler_config).sample()?;
    info!(
        target: event_names::SCAN_FINISHED,
        stage = %Stage::Scan,
        scanned = sample.scanned,
        kept = sample.records.len(),
        dropped = sample.dropped.total(),
        "processes sampled"
    );

    let aggregates = aggregate(sample.records, thresholds.gpu_enabled(), Utc::now());
    let violations = evaluate(&aggregates, &thresholds);
    for violation in &violations {
        let limits: Vec<String> = violation
            .exceeded
            .iter()
            .map(|limit| format!("{}={:.2}>{:.2}", limit.kind, limit.observed, limit.threshold))
            .collect();
        warn!(
            target: event_names::POLICY_VIOLATION,
            stage = %Stage::Evaluate,
            account = %violation.account,
            processes = violation.usage.processes.len(),
            limits = %limits.join(","),
            "account over limit"
        );
    }

    let outcome = controller.enforce(&violations);

    let summary = RunSummary {
        run_id,
        gate,
        dry_run: settings.dummy,
        scanned: sample.scanned,
        dropped: sample.dropped,
        accounts: aggregates.len(),
        violators: violations.iter().map(|v| v.account.clone()).collect(),
        signals_sent: outcome.signals_sent(),
        processes_signalled: outcome.processes_signalled(),
        failures: outcome.failures(),
    };
    info!(
        target: event_names::RUN_FINISHED,
        stage = %Stage::Enforce,
        accounts = summary.accounts,
        violators = summary.violators.len(),
        signals = summary.signals_sent,
        failures = summary.failures,
        exit_code = %summary.exit_code(),
        "run finished"
    );
    Ok(summary)
}

/// Record an on-demand enforcement request for the next `--request-only` run.
pub fn request_enforcement(flag: &dyn RequestFlag) -> Result<(), FlagError> {
    flag.create()?;
    info!(target: event_names::REQUEST_CREATED, "enforcement requested");
    Ok(())
}
