//! User-interaction contract of the connection engine.
//!
//! The engine never blocks on the user. It posts a [`Question`] with an
//! [`AnswerNotifier`], keeps running its state machines, and polls
//! [`ConnectionUi::status`] each time the notifier fires.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Non-blocking notices shown to the user until dismissed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Warning {
    AlreadyConnecting,
    AlreadyClosing,
    VmLocked,
    SshPortOccupied,
    UnableToCloseVm,
    StartFailed,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Warning::AlreadyConnecting => "A connection attempt is already in progress",
            Warning::AlreadyClosing => "The virtual machine is already closing",
            Warning::VmLocked => "The virtual machine is locked down",
            Warning::SshPortOccupied => "The SSH port is already in use by another program",
            Warning::UnableToCloseVm => "The virtual machine refused to close",
            Warning::StartFailed => "The virtual machine failed to start",
        })
    }
}

/// Yes/no prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Question {
    StartVm,
    ResetVm,
    CloseVm,
    RetryConnecting,
    RetryLockingDown,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Question::StartVm => "The virtual machine is not running. Start it?",
            Question::ResetVm => "The virtual machine was started outside. Close it anyway?",
            Question::CloseVm => "The virtual machine was started outside. Close it now?",
            Question::RetryConnecting => "Still unable to connect over SSH. Keep trying?",
            Question::RetryLockingDown => "The virtual machine has not stopped yet. Keep trying?",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuestionStatus {
    #[default]
    NotAsked,
    Asked,
    Yes,
    No,
}

/// Wakes the connection engine when an answer is available.
#[derive(Clone)]
pub struct AnswerNotifier {
    notify: Arc<dyn Fn() + Send + Sync>,
}

impl AnswerNotifier {
    pub fn new(notify: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            notify: Arc::new(notify),
        }
    }

    pub fn notify(&self) {
        (self.notify)();
    }
}

impl fmt::Debug for AnswerNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AnswerNotifier")
    }
}

/// Presentation layer used by [`crate::connection::VmConnection`].
pub trait ConnectionUi: Send + Sync {
    fn warn(&self, warning: Warning);

    fn dismiss_warning(&self, warning: Warning);

    /// Whether `question` should be put to the user at all. Returning `false`
    /// skips the prompt and takes the default action.
    fn should_ask(&self, _question: Question) -> bool {
        true
    }

    /// Post a question. Must return immediately; call `notifier` once the
    /// answer is in.
    fn ask(&self, question: Question, notifier: AnswerNotifier);

    fn status(&self, question: Question) -> QuestionStatus;

    /// Withdraw a question and forget its answer.
    fn dismiss_question(&self, question: Question);
}

// ---------------------------------------------------------------------------
// Headless implementation
// ---------------------------------------------------------------------------

/// Fixed answers for unattended use.
#[derive(Debug, Clone)]
pub struct AnswerPolicy {
    default: bool,
    overrides: HashMap<Question, bool>,
}

impl AnswerPolicy {
    pub fn yes() -> Self {
        Self {
            default: true,
            overrides: HashMap::new(),
        }
    }

    pub fn no() -> Self {
        Self {
            default: false,
            overrides: HashMap::new(),
        }
    }

    pub fn with(mut self, question: Question, answer: bool) -> Self {
        self.overrides.insert(question, answer);
        self
    }

    pub fn answer(&self, question: Question) -> bool {
        self.overrides.get(&question).copied().unwrap_or(self.default)
    }
}

#[derive(Default)]
struct HeadlessState {
    questions: HashMap<Question, QuestionStatus>,
    warnings: HashSet<Warning>,
}

/// Answers questions from an [`AnswerPolicy`] and logs warnings.
///
/// Answers are delivered on a later scheduler tick, like a real UI would.
#[derive(Clone)]
pub struct HeadlessUi {
    policy: AnswerPolicy,
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessUi {
    pub fn new(policy: AnswerPolicy) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(HeadlessState::default())),
        }
    }

    /// Warnings raised and not yet dismissed.
    pub fn active_warnings(&self) -> Vec<Warning> {
        self.state.lock().warnings.iter().copied().collect()
    }
}

impl ConnectionUi for HeadlessUi {
    fn warn(&self, warning: Warning) {
        if self.state.lock().warnings.insert(warning) {
            warn!(?warning, "{warning}");
        }
    }

    fn dismiss_warning(&self, warning: Warning) {
        self.state.lock().warnings.remove(&warning);
    }

    fn ask(&self, question: Question, notifier: AnswerNotifier) {
        let answer = self.policy.answer(question);
        info!(?question, answer, "{question} {}", if answer { "yes" } else { "no" });
        self.state.lock().questions.insert(question, QuestionStatus::Asked);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            {
                let mut state = state.lock();
                // Dismissed in the meantime.
                if state.questions.get(&question) != Some(&QuestionStatus::Asked) {
                    return;
                }
                let status = if answer {
                    QuestionStatus::Yes
                } else {
                    QuestionStatus::No
                };
                state.questions.insert(question, status);
            }
            notifier.notify();
        });
    }

    fn status(&self, question: Question) -> QuestionStatus {
        self.state
            .lock()
            .questions
            .get(&question)
            .copied()
            .unwrap_or_default()
    }

    fn dismiss_question(&self, question: Question) {
        self.state.lock().questions.remove(&question);
    }
}
