//! Notification fan-out: terminals, chat webhook, e-mail.
//!
//! Every channel is best-effort. A failure is logged and recorded in the
//! [`DeliverySummary`] but never prevents the other channels, or the
//! termination that follows, from happening.

pub mod mail;
pub mod terminal;
pub mod webhook;

pub use mail::{build_message, parse_finger_email, FingerDirectory, SmtpMailer};
pub use terminal::{parse_w_sessions, WriteTerminalSink};
pub use webhook::{UreqWebhookClient, WebhookPayload};

use crate::collect::ToolError;
use crate::logging::event_names;
use kh_common::Account;
use kh_config::WebhookIdentity;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Notification delivery errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("helper command failed: {0}")]
    Tool(#[from] ToolError),

    #[error("terminal {tty} not writable: {message}")]
    SessionGone { tty: String, message: String },

    #[error("webhook returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("webhook transport error: {0}")]
    Transport(String),

    #[error("mail delivery failed: {0}")]
    Mail(String),
}

impl NotifyError {
    /// The channel name used in logs and structured errors.
    pub fn channel(&self) -> &'static str {
        match self {
            NotifyError::Tool(_) | NotifyError::SessionGone { .. } => "terminal",
            NotifyError::HttpStatus { .. } | NotifyError::Transport(_) => "webhook",
            NotifyError::Mail(_) => "email",
        }
    }
}

impl From<NotifyError> for kh_common::Error {
    fn from(err: NotifyError) -> Self {
        kh_common::Error::Notification {
            channel: err.channel().to_string(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Lists and writes to a user's terminal sessions.
pub trait TerminalSink {
    fn active_terminals(&self, account: &Account) -> Result<Vec<String>, NotifyError>;
    fn write(&self, account: &Account, tty: &str, text: &str) -> Result<(), NotifyError>;
}

/// Posts JSON to a chat webhook. Returns the HTTP status on success.
pub trait WebhookClient {
    fn post(&self, url: &str, payload: &WebhookPayload) -> Result<u16, NotifyError>;
}

/// Maps an account to its e-mail address.
pub trait MailDirectory {
    fn resolve_email(&self, account: &Account) -> Option<String>;
}

/// Sends mail through the local relay.
pub trait Mailer {
    fn send(&self, from: &str, to: &str, body: &str, port: u16) -> Result<(), NotifyError>;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Webhook destination.
#[derive(Debug, Clone)]
pub struct WebhookTarget {
    pub url: String,
    pub identity: WebhookIdentity,
}

/// E-mail settings for one run.
#[derive(Debug, Clone)]
pub struct MailSettings {
    pub from: String,
    pub port: u16,
    /// Body template; the report is appended to it.
    pub body: String,
}

/// Channels enabled for a run.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub terminal_warning: String,
    pub webhook: Option<WebhookTarget>,
    pub mail: Option<MailSettings>,
}

/// Outcome of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum ChannelStatus {
    Disabled,
    Delivered,
    /// Nothing to deliver to (no address, no session).
    Skipped,
    Failed(String),
}

impl ChannelStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::Failed(_))
    }
}

/// What reached the offender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliverySummary {
    pub terminals_written: usize,
    pub terminal_failures: usize,
    pub webhook: ChannelStatus,
    pub email: ChannelStatus,
}

impl DeliverySummary {
    pub fn failures(&self) -> usize {
        self.terminal_failures
            + usize::from(self.webhook.is_failure())
            + usize::from(self.email.is_failure())
    }
}

/// Sends one report to every enabled channel.
pub struct NotificationDispatcher<'a> {
    config: NotifyConfig,
    terminals: &'a dyn TerminalSink,
    webhook: &'a dyn WebhookClient,
    directory: &'a dyn MailDirectory,
    mailer: &'a dyn Mailer,
}

impl<'a> NotificationDispatcher<'a> {
    pub fn new(
        config: NotifyConfig,
        terminals: &'a dyn TerminalSink,
        webhook: &'a dyn WebhookClient,
        directory: &'a dyn MailDirectory,
        mailer: &'a dyn Mailer,
    ) -> Self {
        Self {
            config,
            terminals,
            webhook,
            directory,
            mailer,
        }
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    /// Deliver `report` about `account` on every enabled channel.
    pub fn dispatch(&self, account: &Account, report: &str) -> DeliverySummary {
        let (terminals_written, terminal_failures) = self.notify_terminals(account, report);
        let summary = DeliverySummary {
            terminals_written,
            terminal_failures,
            webhook: self.notify_webhook(report),
            email: self.notify_email(account, report),
        };
        info!(
            target: event_names::NOTIFY_DISPATCHED,
            account = %account,
            terminals = summary.terminals_written,
            webhook = ?summary.webhook,
            email = ?summary.email,
            "offender notified"
        );
        summary
    }

    fn notify_terminals(&self, account: &Account, report: &str) -> (usize, usize) {
        let ttys = match self.terminals.active_terminals(account) {
            Ok(ttys) => ttys,
            Err(e) => {
                warn!(account = %account, error = %e, "could not list terminal sessions");
                return (0, 1);
            }
        };

        let text = format!("{}\n{}", self.config.terminal_warning.trim_end(), report);
        let mut written = 0;
        for tty in &ttys {
            match self.terminals.write(account, tty, &text) {
                Ok(()) => written += 1,
                // The user logged out between listing and writing.
                Err(e) => debug!(account = %account, tty = %tty, error = %e, "terminal skipped"),
            }
        }
        (written, 0)
    }

    fn notify_webhook(&self, report: &str) -> ChannelStatus {
        let Some(target) = &self.config.webhook else {
            return ChannelStatus::Disabled;
        };
        let payload = WebhookPayload::new(&target.identity, report);
        match self.webhook.post(&target.url, &payload) {
            Ok(status) => {
                debug!(status, "webhook accepted report");
                ChannelStatus::Delivered
            }
            Err(e) => {
                warn!(error = %e, "webhook delivery failed");
                ChannelStatus::Failed(e.to_string())
            }
        }
    }

    fn notify_email(&self, account: &Account, report: &str) -> ChannelStatus {
        let Some(mail) = &self.config.mail else {
            return ChannelStatus::Disabled;
        };
        let Some(address) = self.directory.resolve_email(account) else {
            debug!(account = %account, "no e-mail address on record");
            return ChannelStatus::Skipped;
        };
        let body = format!("{}{}", mail.body, report);
        match self.mailer.send(&mail.from, &address, &body, mail.port) {
            Ok(()) => {
                info!(account = %account, to = %address, "e-mail sent");
                ChannelStatus::Delivered
            }
            Err(e) => {
                warn!(account = %account, error = %e, "e-mail delivery failed");
                ChannelStatus::Failed(e.to_string())
            }
        }
    }
}
