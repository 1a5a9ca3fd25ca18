//! External command execution.
//!
//! Every call to a slow, unreliable CLI tool (VBoxManage, docker, ssh) is a
//! [`CommandRunner`]. Runners are handed to the process-wide
//! [`queue::CommandQueue`], which runs them one at a time.
//!
//! ```text
//! backend op ──► CommandQueue::enqueue(runner) ──► CommandHandle
//!                      │                                 │
//!                      └─► dispatcher task: run() ──────►└─► wait() -> CommandResult
//! ```

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod checkpoint;
pub mod process;
pub mod queue;
pub mod remote;

pub use checkpoint::CheckpointRunner;
pub use process::ProcessRunner;
pub use queue::{BatchId, CommandHandle, CommandQueue};
pub use remote::RemoteProcessRunner;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start `{program}`: {message}")]
    Spawn { program: String, message: String },

    #[error("`{command}` crashed: {stderr}")]
    Crashed { command: String, stderr: String },

    #[error("`{command}` exited with code {code}: {stderr}")]
    UnexpectedExit {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("connection to {target} failed: {stderr}")]
    Connection { target: String, stderr: String },

    #[error("`{command}` was terminated")]
    Terminated { command: String },

    #[error("command was cancelled before it started")]
    Cancelled,
}

/// Terminal event of a runner: `Ok` is `done(true)`, `Err` is `done(false)`.
pub type CommandResult = Result<CommandOutput, CommandError>;

/// Exit codes that count as success. Defaults to `{0}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedExitCodes(Vec<i32>);

impl ExpectedExitCodes {
    pub fn new(codes: impl IntoIterator<Item = i32>) -> Self {
        Self(codes.into_iter().collect())
    }

    pub fn contains(&self, code: i32) -> bool {
        self.0.contains(&code)
    }
}

impl Default for ExpectedExitCodes {
    fn default() -> Self {
        Self(vec![0])
    }
}

// ---------------------------------------------------------------------------
// Runner contract
// ---------------------------------------------------------------------------

/// A single external invocation.
///
/// `run` is called at most once by the queue and its return value is the
/// runner's one and only `done` notification. Implementations must never
/// complete synchronously: even a failure detected before any work starts is
/// reported after yielding to the scheduler, so every runner behaves like a
/// real asynchronous command from the queue's point of view.
///
/// Termination is requested by cancelling `cancel`. Cancelling is idempotent
/// and may happen before `run` is ever called.
#[async_trait]
pub trait CommandRunner: fmt::Display + Send {
    async fn run(&mut self, cancel: CancellationToken) -> CommandResult;
}

#[async_trait]
impl CommandRunner for Box<dyn CommandRunner> {
    async fn run(&mut self, cancel: CancellationToken) -> CommandResult {
        (**self).run(cancel).await
    }
}

/// Everything a finished process tells us, before classification.
#[derive(Debug)]
pub(crate) struct Finished {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// We asked the process to terminate.
    pub terminated: bool,
}

/// Map a finished process onto success or failure.
///
/// A process that was terminated on request, or that died from a signal,
/// only counts as successful when `crash_expected` is set.
pub(crate) fn classify(
    command: &str,
    finished: Finished,
    expected: &ExpectedExitCodes,
    crash_expected: bool,
) -> CommandResult {
    let Finished {
        exit_code,
        stdout,
        stderr,
        terminated,
    } = finished;

    let output = CommandOutput {
        exit_code,
        stdout,
        stderr,
    };

    if terminated {
        return if crash_expected {
            Ok(output)
        } else {
            Err(CommandError::Terminated {
                command: command.to_string(),
            })
        };
    }

    match exit_code {
        None if crash_expected => Ok(output),
        None => Err(CommandError::Crashed {
            command: command.to_string(),
            stderr: output.stderr.trim().to_string(),
        }),
        Some(code) if expected.contains(code) => Ok(output),
        Some(code) => Err(CommandError::UnexpectedExit {
            command: command.to_string(),
            code,
            stdout: output.stdout,
            stderr: output.stderr.trim().to_string(),
        }),
    }
}
