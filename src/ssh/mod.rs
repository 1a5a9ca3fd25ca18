//! SSH access to the guest.
//!
//! The connection engine holds at most one interactive [`SshSession`] per VM
//! and obtains it through an [`SshConnector`]. The production connector
//! ([`openssh::OpenSshConnector`]) drives the system `ssh` client; tests plug
//! in their own.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandRunner, RemoteProcessRunner};

pub mod openssh;

pub use openssh::OpenSshConnector;

/// Overrides the `ssh` binary.
pub const SSH_ENV: &str = "VMLINK_SSH";

/// Per-attempt connect timeout in milliseconds.
pub const TRY_CONNECT_TIMEOUT_ENV: &str = "VMLINK_SSH_TRY_CONNECT_TIMEOUT";

pub const DEFAULT_TRY_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Options shared by every ssh invocation.
///
/// Guest host keys change whenever an image is rebuilt, so they are neither
/// checked nor recorded. `BatchMode` makes ssh fail instead of prompting.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ServerAliveInterval=5",
    "-o", "ServerAliveCountMax=3",
];

pub fn ssh_program() -> String {
    std::env::var(SSH_ENV).unwrap_or_else(|_| "ssh".to_string())
}

/// Reads [`TRY_CONNECT_TIMEOUT_ENV`], falling back to the default for
/// missing or malformed values.
pub fn try_connect_timeout_from_env() -> Duration {
    std::env::var(TRY_CONNECT_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TRY_CONNECT_TIMEOUT)
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// How to reach the guest's sshd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshParameters {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: Option<PathBuf>,
    /// Boot grace period: connection failures within this many seconds of
    /// the VM starting are retried silently.
    pub connection_timeout_secs: u64,
    /// Run over ssh to shut the guest down gracefully.
    pub shutdown_command: String,
}

impl Default for SshParameters {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2222,
            user: "builder".to_string(),
            private_key: None,
            connection_timeout_secs: 30,
            shutdown_command: "sudo /sbin/poweroff".to_string(),
        }
    }
}

impl SshParameters {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Per-attempt timeout for one-off remote commands.
    pub fn attempt_timeout(&self) -> Duration {
        try_connect_timeout_from_env()
    }

    /// `user@host:port`, for logs and error messages.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// Arguments for `ssh` up to, but not including, the remote command.
    pub fn ssh_args(&self, connect_timeout: Duration) -> Vec<String> {
        let connect_secs = connect_timeout.as_millis().div_ceil(1000).max(1);
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
        args.extend([
            "-o".to_string(),
            format!("ConnectTimeout={connect_secs}"),
            "-p".to_string(),
            self.port.to_string(),
        ]);
        if let Some(key) = &self.private_key {
            args.extend([
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
                "-i".to_string(),
                key.display().to_string(),
            ]);
        }
        args.push(format!("{}@{}", self.user, self.host));
        args
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Closed after [`SshSession::disconnect`].
    Closed,
    /// Dropped without being asked to.
    Lost(String),
}

/// A live interactive connection to the guest.
///
/// Dropping the session tears the connection down.
#[derive(Debug)]
pub struct SshSession {
    stop: CancellationToken,
    ended: Option<oneshot::Receiver<SessionEnd>>,
}

/// Connector side of a session: observes the stop request and reports the
/// end of the connection.
#[derive(Debug)]
pub struct SessionControl {
    pub stop: CancellationToken,
    pub ended: oneshot::Sender<SessionEnd>,
}

impl SshSession {
    pub fn channel() -> (SessionControl, SshSession) {
        let stop = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        (
            SessionControl {
                stop: stop.clone(),
                ended: tx,
            },
            SshSession {
                stop,
                ended: Some(rx),
            },
        )
    }

    /// Request an orderly close. The end is reported as [`SessionEnd::Closed`].
    pub fn disconnect(&self) {
        self.stop.cancel();
    }

    /// Receiver for the end notification. Can be taken once.
    pub fn take_end_signal(&mut self) -> Option<oneshot::Receiver<SessionEnd>> {
        self.ended.take()
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SshError {
    #[error("failed to start ssh: {0}")]
    Spawn(String),

    #[error("timed out connecting to {target}")]
    Timeout { target: String },

    #[error("could not connect to {target}: {message}")]
    Failed { target: String, message: String },
}

/// Opens interactive sessions and builds remote runners.
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// One connection attempt, bounded by `attempt_timeout`.
    async fn connect(&self, params: &SshParameters, attempt_timeout: Duration) -> Result<SshSession, SshError>;

    /// Runner that shuts the guest down. The connection dropping after
    /// login counts as success; failing to log in does not.
    fn shutdown_runner(&self, params: &SshParameters) -> Box<dyn CommandRunner> {
        Box::new(RemoteProcessRunner::new(params, params.shutdown_command.clone()).crash_expected(true))
    }
}
