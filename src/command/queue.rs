//! Process-wide serialized command executor.
//!
//! One dispatcher task pops runners off a deque and runs them strictly one at
//! a time. Producers get a [`CommandHandle`] back to await the result or
//! request termination.
//!
//! Entries enqueued between [`CommandQueue::begin_batch`] and
//! [`CommandQueue::end_batch`] share a [`BatchId`], so a multi-step operation
//! can drop its remaining steps after one of them fails with
//! [`CommandQueue::cancel_batch`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{CheckpointRunner, CommandError, CommandResult, CommandRunner};

// ---------------------------------------------------------------------------
// Batch ids
// ---------------------------------------------------------------------------

/// Groups queue entries. Real ids are positive and wrap back to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(i32);

impl BatchId {
    /// Entries queued outside of any batch.
    pub const NONE: BatchId = BatchId(-1);

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Producer side of one queued runner.
#[derive(Debug)]
pub struct CommandHandle {
    batch: BatchId,
    cancel: CancellationToken,
    result: oneshot::Receiver<CommandResult>,
}

impl CommandHandle {
    pub fn batch(&self) -> BatchId {
        self.batch
    }

    /// Ask the runner to stop. Idempotent; a runner that has not started yet
    /// finishes with a termination error as soon as it is dispatched.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Token that terminates the runner when cancelled, for callers that
    /// hand the result off to another task.
    pub fn terminator(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the runner's `done`. Entries removed by
    /// [`CommandQueue::cancel_batch`] resolve to [`CommandError::Cancelled`].
    pub async fn wait(self) -> CommandResult {
        self.result.await.unwrap_or(Err(CommandError::Cancelled))
    }
}

enum Completion {
    Channel(oneshot::Sender<CommandResult>),
    Callback(Box<dyn FnOnce(CommandResult) + Send>),
}

impl Completion {
    fn complete(self, result: CommandResult) {
        match self {
            // The producer may have dropped its handle.
            Completion::Channel(tx) => {
                let _ = tx.send(result);
            }
            Completion::Callback(callback) => callback(result),
        }
    }
}

struct Entry {
    batch: BatchId,
    runner: Box<dyn CommandRunner>,
    cancel: CancellationToken,
    completion: Completion,
    /// A failure drops the rest of the batch.
    cancel_rest_on_failure: bool,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    entries: VecDeque<Entry>,
    current_batch: Option<BatchId>,
    last_batch: i32,
    running: bool,
    /// Thread currently delivering a finished runner's completion.
    postprocessing: Option<ThreadId>,
}

impl State {
    fn next_batch_id(&mut self) -> BatchId {
        self.last_batch = match self.last_batch.checked_add(1) {
            Some(id) if id > 0 => id,
            _ => 1,
        };
        BatchId(self.last_batch)
    }

    fn batch(&self) -> BatchId {
        self.current_batch.unwrap_or(BatchId::NONE)
    }
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    idle: Notify,
}

/// FIFO executor shared by every backend and the connection engine.
///
/// Create one per process with [`CommandQueue::new`] (inside a tokio
/// runtime) and share the returned `Arc`. Dropping the last reference lets
/// the dispatcher drain what is already queued and exit.
pub struct CommandQueue {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl CommandQueue {
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Notify::new(),
            idle: Notify::new(),
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(dispatch(Arc::clone(&shared), shutdown.clone()));
        Arc::new(Self { shared, shutdown })
    }

    // -- batches ------------------------------------------------------------

    /// Open a batch; entries enqueued until [`Self::end_batch`] carry the
    /// returned id.
    pub fn begin_batch(&self) -> BatchId {
        let mut state = self.shared.state.lock();
        if let Some(open) = state.current_batch {
            warn!(batch = %open, "begin_batch called while a batch is open");
        }
        let id = state.next_batch_id();
        state.current_batch = Some(id);
        id
    }

    pub fn end_batch(&self) {
        self.shared.state.lock().current_batch = None;
    }

    pub fn current_batch(&self) -> BatchId {
        self.shared.state.lock().batch()
    }

    /// Remove the entries of `batch` that sit contiguously at the head of the
    /// queue. Entries of the batch further back, behind an entry of another
    /// batch, are kept. Returns how many entries were removed.
    pub fn cancel_batch(&self, batch: BatchId) -> usize {
        cancel_front(&self.shared, batch)
    }

    // -- enqueueing ---------------------------------------------------------

    /// Append a runner to the back of the queue.
    ///
    /// Must not be called while a finished runner's completion is being
    /// delivered; use the `_immediate` variants from completion callbacks.
    pub fn enqueue<R: CommandRunner + 'static>(&self, runner: R) -> CommandHandle {
        self.push(Box::new(runner), false)
    }

    /// Push a runner to the front of the queue. Immediate entries queued
    /// back to back therefore run in reverse order.
    pub fn enqueue_immediate<R: CommandRunner + 'static>(&self, runner: R) -> CommandHandle {
        self.push(Box::new(runner), true)
    }

    /// Queue a barrier that calls `callback` once everything queued before it
    /// has finished.
    pub fn enqueue_checkpoint<F>(&self, callback: F) -> BatchId
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_checkpoint(Box::new(callback), false)
    }

    pub fn enqueue_immediate_checkpoint<F>(&self, callback: F) -> BatchId
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_checkpoint(Box::new(callback), true)
    }

    /// Queue several runners as one new batch, atomically. The first failing
    /// runner cancels the entries of the batch still waiting behind it, so
    /// their handles resolve to [`CommandError::Cancelled`].
    pub fn enqueue_batch(&self, runners: Vec<Box<dyn CommandRunner>>) -> (BatchId, Vec<CommandHandle>) {
        let (batch, handles) = {
            let mut state = self.shared.state.lock();
            check_not_postprocessing(&state, "enqueue_batch");
            let batch = state.next_batch_id();
            let handles = runners
                .into_iter()
                .map(|runner| {
                    let (mut entry, handle) = channel_entry(batch, runner);
                    entry.cancel_rest_on_failure = true;
                    state.entries.push_back(entry);
                    handle
                })
                .collect::<Vec<_>>();
            (batch, handles)
        };
        trace!(batch = %batch, count = handles.len(), "batch queued");
        self.shared.wake.notify_one();
        (batch, handles)
    }

    /// Like [`CommandQueue::enqueue_batch`], but the batch goes to the front
    /// of the queue, ahead of everything waiting. The runners keep their
    /// order and nothing else can be scheduled between them.
    pub fn enqueue_immediate_batch(&self, runners: Vec<Box<dyn CommandRunner>>) -> (BatchId, Vec<CommandHandle>) {
        let (batch, handles) = {
            let mut state = self.shared.state.lock();
            let batch = state.next_batch_id();
            let mut handles = Vec::with_capacity(runners.len());
            for runner in runners.into_iter().rev() {
                let (mut entry, handle) = channel_entry(batch, runner);
                entry.cancel_rest_on_failure = true;
                state.entries.push_front(entry);
                handles.push(handle);
            }
            handles.reverse();
            (batch, handles)
        };
        trace!(batch = %batch, count = handles.len(), "immediate batch queued");
        self.shared.wake.notify_one();
        (batch, handles)
    }

    // -- introspection ------------------------------------------------------

    /// Number of entries waiting to run (excluding the running one).
    pub fn pending(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.entries.is_empty() && !state.running
    }

    /// Resolve once the queue is empty and nothing is running. Used to drain
    /// outstanding work before process exit.
    pub async fn wait(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    // -- internals ----------------------------------------------------------

    fn push(&self, runner: Box<dyn CommandRunner>, front: bool) -> CommandHandle {
        let handle = {
            let mut state = self.shared.state.lock();
            if !front {
                check_not_postprocessing(&state, "enqueue");
            }
            let (entry, handle) = channel_entry(state.batch(), runner);
            trace!(command = %entry.runner, batch = %entry.batch, front, "command queued");
            if front {
                state.entries.push_front(entry);
            } else {
                state.entries.push_back(entry);
            }
            handle
        };
        self.shared.wake.notify_one();
        handle
    }

    fn push_checkpoint(&self, callback: Box<dyn FnOnce() + Send>, front: bool) -> BatchId {
        let batch = {
            let mut state = self.shared.state.lock();
            if !front {
                check_not_postprocessing(&state, "enqueue_checkpoint");
            }
            let batch = state.batch();
            let entry = Entry {
                batch,
                runner: Box::new(CheckpointRunner::new()),
                cancel: CancellationToken::new(),
                completion: Completion::Callback(Box::new(move |_| callback())),
                cancel_rest_on_failure: false,
            };
            if front {
                state.entries.push_front(entry);
            } else {
                state.entries.push_back(entry);
            }
            batch
        };
        self.shared.wake.notify_one();
        batch
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let pending = self.shared.state.lock().entries.len();
        if pending > 0 {
            debug!(pending, "command queue released with pending commands, draining");
        }
        self.shutdown.cancel();
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CommandQueue")
            .field("pending", &state.entries.len())
            .field("running", &state.running)
            .field("current_batch", &state.current_batch)
            .finish()
    }
}

fn channel_entry(batch: BatchId, runner: Box<dyn CommandRunner>) -> (Entry, CommandHandle) {
    let (tx, rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    let entry = Entry {
        batch,
        runner,
        cancel: cancel.clone(),
        completion: Completion::Channel(tx),
        cancel_rest_on_failure: false,
    };
    let handle = CommandHandle {
        batch,
        cancel,
        result: rx,
    };
    (entry, handle)
}

fn cancel_front(shared: &Shared, batch: BatchId) -> usize {
    if batch == BatchId::NONE {
        return 0;
    }
    let removed: Vec<Entry> = {
        let mut state = shared.state.lock();
        let mut removed = Vec::new();
        while state.entries.front().is_some_and(|e| e.batch == batch) {
            if let Some(entry) = state.entries.pop_front() {
                removed.push(entry);
            }
        }
        removed
    };
    if !removed.is_empty() {
        debug!(batch = %batch, count = removed.len(), "cancelled queued commands");
    }
    // Dropping the entries outside the lock resolves their handles.
    removed.len()
}

fn check_not_postprocessing(state: &State, operation: &'static str) {
    if state.postprocessing == Some(thread::current().id()) {
        error!(operation, "command queued from a completion callback; use the immediate variant");
        debug_assert!(false, "{operation} called during post-processing");
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn dispatch(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        let entry = {
            let mut state = shared.state.lock();
            let entry = state.entries.pop_front();
            state.running = entry.is_some();
            entry
        };

        let Some(Entry {
            batch,
            mut runner,
            cancel,
            completion,
            cancel_rest_on_failure,
        }) = entry
        else {
            shared.idle.notify_waiters();
            let stopped = tokio::select! {
                () = shared.wake.notified() => false,
                () = shutdown.cancelled() => true,
            };
            if stopped {
                trace!("command dispatcher stopped");
                return;
            }
            continue;
        };

        debug!(command = %runner, batch = %batch, "running command");
        let result = runner.run(cancel).await;
        match &result {
            Ok(output) => debug!(command = %runner, exit_code = ?output.exit_code, "command succeeded"),
            Err(e) => debug!(command = %runner, error = %e, "command failed"),
        }

        {
            let mut state = shared.state.lock();
            state.running = false;
            state.postprocessing = Some(thread::current().id());
        }
        if result.is_err() && cancel_rest_on_failure {
            cancel_front(&shared, batch);
        }
        completion.complete(result);
        shared.state.lock().postprocessing = None;
        drop(runner);

        // The next runner starts on a later tick, never from inside `done`.
        tokio::task::yield_now().await;
    }
}
