//! Terminal delivery via `w` and `write`.

use super::{NotifyError, TerminalSink};
use crate::collect::{ToolRunner, ToolSpec};
use kh_common::Account;

/// procps `w` cuts the USER column to 8 characters unless widened; 32 is
/// the widest it allows.
const W_USER_WIDTH: &str = "32";

/// Lists sessions with `w -s -h` and writes with `write <user> <tty>`.
#[derive(Debug, Clone, Default)]
pub struct WriteTerminalSink {
    runner: ToolRunner,
}

impl WriteTerminalSink {
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }
}

impl TerminalSink for WriteTerminalSink {
    fn active_terminals(&self, account: &Account) -> Result<Vec<String>, NotifyError> {
        let output = self.runner.run(&sessions_command())?.into_success()?;
        Ok(parse_w_sessions(&output.stdout_str(), account.as_str()))
    }

    fn write(&self, account: &Account, tty: &str, text: &str) -> Result<(), NotifyError> {
        let spec = ToolSpec::new("write", vec![account.to_string(), tty.to_string()])
            .with_stdin(format!("{text}\n"));
        let output = self.runner.run(&spec)?;
        if output.success() {
            Ok(())
        } else {
            Err(NotifyError::SessionGone {
                tty: tty.to_string(),
                message: output.stderr_str().trim().to_string(),
            })
        }
    }
}

/// `w -s -h` with full-width user names.
fn sessions_command() -> ToolSpec {
    ToolSpec::new("w", vec!["-s".to_string(), "-h".to_string()])
        .with_env("PROCPS_USERLEN", W_USER_WIDTH)
}

/// Terminals of `user` in `w -s -h` output.
///
/// Each line is `USER TTY FROM IDLE WHAT`; only lines whose first column is
/// exactly `user` count, so `p10000` does not pick up `p100001`'s sessions.
pub fn parse_w_sessions(output: &str, user: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let who = columns.next()?;
            let tty = columns.next()?;
            (who == user).then(|| tty.to_string())
        })
        .collect()
}
