//! Remote process runner: a command executed inside the guest over ssh.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::process::ProcessRunner;
use super::{classify, CommandError, CommandOutput, CommandResult, CommandRunner, ExpectedExitCodes, Finished};
use crate::ssh::{self, SshParameters};

/// ssh reports its own failures (connection refused, auth, dropped link)
/// with this exit status.
pub const SSH_CONNECTION_ERROR: i32 = 255;

/// Printed by the guest shell before the command runs. Seeing it means the
/// session was established, so a later exit 255 is the link going down.
const SESSION_MARKER: &str = "vmlink-session-established";

pub struct RemoteProcessRunner {
    target: String,
    command: String,
    inner: ProcessRunner,
}

impl RemoteProcessRunner {
    pub fn new(params: &SshParameters, command: impl Into<String>) -> Self {
        let command = command.into();
        let inner = ProcessRunner::new(ssh::ssh_program())
            .args(params.ssh_args(params.attempt_timeout()))
            .arg(format!("echo {SESSION_MARKER}; {command}"));
        Self {
            target: params.target(),
            command,
            inner,
        }
    }

    pub fn expected_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.inner = self.inner.expected_exit_codes(codes);
        self
    }

    /// The connection dropping once the session is up (or ssh being
    /// terminated) counts as success. Used for commands that shut the guest
    /// down. Failing to connect in the first place is still an error.
    pub fn crash_expected(mut self, crash_expected: bool) -> Self {
        self.inner = self.inner.crash_expected(crash_expected);
        self
    }

    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.inner = self.inner.stdin(data);
        self
    }
}

impl fmt::Display for RemoteProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.target, self.command)
    }
}

#[async_trait]
impl CommandRunner for RemoteProcessRunner {
    async fn run(&mut self, cancel: CancellationToken) -> CommandResult {
        let finished = self.inner.execute(&cancel).await?;
        settle(
            &self.target,
            &self.to_string(),
            finished,
            self.inner.expected(),
            self.inner.is_crash_expected(),
        )
    }
}

/// Remove the session marker from `stdout`. Returns whether it was there.
fn take_session_marker(stdout: &mut String) -> bool {
    let Some(rest) = stdout.strip_prefix(SESSION_MARKER) else {
        return false;
    };
    *stdout = rest.strip_prefix('\n').unwrap_or(rest).to_string();
    true
}

fn settle(
    target: &str,
    command: &str,
    mut finished: Finished,
    expected: &ExpectedExitCodes,
    crash_expected: bool,
) -> CommandResult {
    let established = take_session_marker(&mut finished.stdout);

    if finished.exit_code == Some(SSH_CONNECTION_ERROR) && !finished.terminated {
        if crash_expected && established {
            return Ok(CommandOutput {
                exit_code: finished.exit_code,
                stdout: finished.stdout,
                stderr: finished.stderr,
            });
        }
        return Err(CommandError::Connection {
            target: target.to_string(),
            stderr: finished.stderr.trim().to_string(),
        });
    }

    classify(command, finished, expected, crash_expected)
}
