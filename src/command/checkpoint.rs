//! No-op runner used as an ordering barrier in the queue.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CommandOutput, CommandResult, CommandRunner};

/// Completes successfully on the next scheduler tick without running anything.
///
/// Queued through [`super::CommandQueue::enqueue_checkpoint`], whose callback
/// is invoked once every runner queued before it has finished.
#[derive(Debug, Default)]
pub struct CheckpointRunner {
    label: Option<String>,
}

impl CheckpointRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }
}

impl fmt::Display for CheckpointRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "checkpoint ({label})"),
            None => f.write_str("checkpoint"),
        }
    }
}

#[async_trait]
impl CommandRunner for CheckpointRunner {
    async fn run(&mut self, _cancel: CancellationToken) -> CommandResult {
        tokio::task::yield_now().await;
        Ok(CommandOutput::default())
    }
}
