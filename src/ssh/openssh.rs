//! Interactive sessions over the system `ssh` client.
//!
//! A session is a long-running `ssh -T` whose remote side prints a marker
//! line and then blocks reading stdin. Seeing the marker means the
//! connection is up; the process exiting means it is gone.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ssh_program, SessionControl, SessionEnd, SshConnector, SshError, SshParameters, SshSession};

const READY_MARKER: &str = "vmlink-session-ready";

#[derive(Debug, Default, Clone)]
pub struct OpenSshConnector;

impl OpenSshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn connect(&self, params: &SshParameters, attempt_timeout: Duration) -> Result<SshSession, SshError> {
        let target = params.target();
        let remote = format!("echo {READY_MARKER}; exec cat >/dev/null");

        let mut child = Command::new(ssh_program())
            .arg("-T")
            .args(params.ssh_args(attempt_timeout))
            .arg(remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SshError::Spawn(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SshError::Spawn("ssh stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let ready = tokio::time::timeout(attempt_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim() == READY_MARKER {
                    return true;
                }
            }
            false
        })
        .await;

        match ready {
            Ok(true) => {}
            Ok(false) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                let _ = child.wait().await;
                debug!(%target, stderr = stderr.trim(), "ssh attempt failed");
                return Err(SshError::Failed {
                    target,
                    message: stderr.trim().to_string(),
                });
            }
            Err(_) => {
                let _ = child.start_kill();
                debug!(%target, ?attempt_timeout, "ssh attempt timed out");
                return Err(SshError::Timeout { target });
            }
        }

        info!(%target, "ssh session established");
        drop(lines);

        let (SessionControl { stop, ended }, session) = SshSession::channel();
        tokio::spawn(async move {
            // Holding stdin open keeps the remote `cat` alive.
            let stdin = child.stdin.take();
            let end = tokio::select! {
                () = stop.cancelled() => {
                    drop(stdin);
                    let _ = child.kill().await;
                    SessionEnd::Closed
                }
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("ssh exited with {status}"),
                        Err(e) => format!("ssh wait failed: {e}"),
                    };
                    warn!(%target, %reason, "ssh session lost");
                    SessionEnd::Lost(reason)
                }
            };
            let _ = ended.send(end);
        });

        Ok(session)
    }
}
