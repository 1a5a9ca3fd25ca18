//! Local process runner.
//!
//! Spawns a program with `tokio::process::Command`, captures stdout/stderr and
//! classifies the exit. Termination sends SIGTERM first and escalates to a
//! hard kill when the process ignores it.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{classify, CommandError, CommandResult, CommandRunner, ExpectedExitCodes, Finished};

/// Grace period between SIGTERM and the hard kill.
pub const KILL_TIMEOUT: Duration = Duration::from_millis(3000);

pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin: Option<String>,
    expected: ExpectedExitCodes,
    crash_expected: bool,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            expected: ExpectedExitCodes::default(),
            crash_expected: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Data written to the child's stdin, which is closed afterwards.
    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn expected_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.expected = ExpectedExitCodes::new(codes);
        self
    }

    /// Treat death by signal, or termination on request, as success.
    pub fn crash_expected(mut self, crash_expected: bool) -> Self {
        self.crash_expected = crash_expected;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Run the process to completion and return the raw result, without
    /// exit-code classification.
    pub(crate) async fn execute(&mut self, cancel: &CancellationToken) -> Result<Finished, CommandError> {
        if cancel.is_cancelled() {
            tokio::task::yield_now().await;
            return Ok(Finished {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                terminated: true,
            });
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Never report synchronously.
                tokio::task::yield_now().await;
                return Err(CommandError::Spawn {
                    program: self.program.clone(),
                    message: e.to_string(),
                });
            }
        };

        debug!(command = %self, pid = ?child.id(), "process started");

        if let (Some(input), Some(mut pipe)) = (self.stdin.take(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!(error = %e, "failed to write process stdin");
                }
            });
        }

        let stdout = tokio::spawn(read_to_string(child.stdout.take()));
        let stderr = tokio::spawn(read_to_string(child.stderr.take()));

        let mut terminated = false;
        let status = tokio::select! {
            status = child.wait() => status,
            () = cancel.cancelled() => {
                terminated = true;
                terminate(&mut child, &self.to_string()).await
            }
        };

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(command = %self, error = %e, "failed to wait for process");
                None
            }
        };

        Ok(Finished {
            exit_code,
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
            terminated,
        })
    }

    pub(crate) fn expected(&self) -> &ExpectedExitCodes {
        &self.expected
    }

    pub(crate) fn is_crash_expected(&self) -> bool {
        self.crash_expected
    }
}

impl fmt::Display for ProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&mut self, cancel: CancellationToken) -> CommandResult {
        let finished = self.execute(&cancel).await?;
        classify(&self.to_string(), finished, &self.expected, self.crash_expected)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn read_to_string<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "failed to read process output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Ask the child to exit, then kill it if it is still around after
/// [`KILL_TIMEOUT`].
async fn terminate(child: &mut Child, command: &str) -> std::io::Result<std::process::ExitStatus> {
    if !send_sigterm(child) {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(command, "process ignored SIGTERM, killing");
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `pid` belongs to a child we spawned and have not reaped yet.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
