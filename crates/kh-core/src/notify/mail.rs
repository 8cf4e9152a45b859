//! E-mail address lookup and delivery.

use super::{MailDirectory, Mailer, NotifyError};
use crate::collect::ToolRunner;
use kh_common::Account;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{Address, Message, SmtpTransport, Transport};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

pub const SENDER_DISPLAY_NAME: &str = "(Kill Hogs)";
pub const SUBJECT: &str = "Processes killed.";
const RELAY_HOST: &str = "localhost";

/// Resolves addresses from the `Name:` field reported by `finger -l -m`.
#[derive(Debug, Clone, Default)]
pub struct FingerDirectory {
    runner: ToolRunner,
}

impl FingerDirectory {
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }
}

impl MailDirectory for FingerDirectory {
    fn resolve_email(&self, account: &Account) -> Option<String> {
        let output = match self.runner.run_tool("finger", &[account.as_str(), "-l", "-m"]) {
            Ok(output) => output,
            Err(e) => {
                debug!(account = %account, error = %e, "finger unavailable");
                return None;
            }
        };
        parse_finger_email(&output.stdout_str())
    }
}

fn finger_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Name: ([^@\s]+@[^@\s]+\.[^@\s]+)\s*$").expect("static regex is valid")
    })
}

/// E-mail address from the first line of `finger -l -m` output.
///
/// Sites store the address in the GECOS name field, so the first line reads
/// `Login: p100001    Name: someone@example.org`. Exactly one `@` with a
/// dot after it is required.
pub fn parse_finger_email(output: &str) -> Option<String> {
    let first = output.lines().next()?;
    finger_name_re()
        .captures(first)
        .map(|caps| caps[1].to_string())
}

/// Build the notification message.
pub fn build_message(from: &str, to: &str, body: &str) -> Result<Message, NotifyError> {
    let from_addr: Address = from
        .parse()
        .map_err(|e| NotifyError::Mail(format!("invalid sender {from:?}: {e}")))?;
    let to_addr: Address = to
        .parse()
        .map_err(|e| NotifyError::Mail(format!("invalid recipient {to:?}: {e}")))?;

    Message::builder()
        .from(Mailbox::new(Some(SENDER_DISPLAY_NAME.to_string()), from_addr))
        .to(Mailbox::new(None, to_addr))
        .subject(SUBJECT)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| NotifyError::Mail(e.to_string()))
}

/// SMTP delivery to the local relay.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, from: &str, to: &str, body: &str, port: u16) -> Result<(), NotifyError> {
        let message = build_message(from, to, body)?;
        let transport = SmtpTransport::builder_dangerous(RELAY_HOST)
            .port(port)
            .timeout(Some(self.timeout))
            .build();
        transport
            .send(&message)
            .map(|_| ())
            .map_err(|e| NotifyError::Mail(e.to_string()))
    }
}
