//! One-shot timers that post back into the engine's event queue.
//!
//! Each (re)start bumps a generation; a firing that arrives after the timer
//! was stopped or restarted carries a stale generation and is ignored.

use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::AbortHandle;

use super::machine::{Event, post};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// VM state polling.
    Poll,
    /// Start, soft-close and hard-close deadlines.
    VmState,
    /// Delay between SSH connection attempts.
    SshRetry,
}

#[derive(Debug)]
pub(crate) struct Timer {
    kind: TimerKind,
    generation: u64,
    task: Option<AbortHandle>,
    interval: Option<Duration>,
    fired: bool,
}

impl Timer {
    fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            task: None,
            interval: None,
            fired: false,
        }
    }

    pub(crate) fn start(&mut self, after: Duration, events: &WeakUnboundedSender<Event>) {
        self.stop();
        self.generation += 1;
        self.interval = Some(after);

        let kind = self.kind;
        let generation = self.generation;
        let events = events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            post(&events, Event::TimerFired(kind, generation));
        });
        self.task = Some(task.abort_handle());
    }

    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation += 1;
        self.fired = false;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Delay of the most recent start.
    pub(crate) fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub(crate) fn has_fired(&self) -> bool {
        self.fired
    }

    pub(crate) fn take_fired(&mut self) -> bool {
        std::mem::take(&mut self.fired)
    }

    /// Record a firing. Returns `false` for stale generations.
    pub(crate) fn on_fired(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.task.is_none() {
            return false;
        }
        self.task = None;
        self.fired = true;
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug)]
pub(crate) struct Timers {
    pub(crate) poll: Timer,
    pub(crate) vm_state: Timer,
    pub(crate) ssh_retry: Timer,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            poll: Timer::new(TimerKind::Poll),
            vm_state: Timer::new(TimerKind::VmState),
            ssh_retry: Timer::new(TimerKind::SshRetry),
        }
    }

    pub(crate) fn get_mut(&mut self, kind: TimerKind) -> &mut Timer {
        match kind {
            TimerKind::Poll => &mut self.poll,
            TimerKind::VmState => &mut self.vm_state,
            TimerKind::SshRetry => &mut self.ssh_retry,
        }
    }
}
