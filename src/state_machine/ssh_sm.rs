//! SSH connection state machine. Only makes progress while the VM machine
//! is in `Running`; any other VM state forces it back to `NotConnected`.
//!
//! Connection failures within the boot grace period (the VM's boot time
//! plus [`crate::ssh::SshParameters::connection_timeout`]) are retried
//! silently. After that the user is asked whether to keep trying, and
//! attempts continue in the background while the question is open.

use statig::prelude::*;
use tokio::time::Instant;
use tracing::info;

use crate::connection::machine::Machine;
use crate::ui::{Question, QuestionStatus};

use super::{SshState, Step};

#[derive(Debug, Default)]
pub(crate) struct SshMachine;

#[state_machine(initial = "State::not_connected()", state(derive(Debug, Clone, PartialEq)))]
impl SshMachine {
    #[state(entry_action = "forget_session")]
    fn not_connected(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_ready() || closing_requested(context) {
            return Handled;
        }
        if context.connect_requested || context.auto_connect {
            return go(context, event, State::connecting(), "VM running");
        }
        Handled
    }

    #[action]
    fn forget_session(context: &mut Machine) {
        context.drop_session();
    }

    #[state(entry_action = "enter_connecting", exit_action = "exit_connecting")]
    fn connecting(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_ready() {
            return go(context, event, State::not_connected(), "VM not running");
        }
        if closing_requested(context) {
            return go(context, event, State::disconnected(), "cancelled");
        }
        if context.ssh_connected {
            return go(context, event, State::connected(), "connected");
        }

        if let Some(error) = context.ssh_attempt_error.take() {
            context.ssh_last_error = Some(error);
            if Instant::now() >= context.grace_deadline
                && context.ui.status(Question::RetryConnecting) == QuestionStatus::NotAsked
            {
                if !context.ui.should_ask(Question::RetryConnecting) {
                    return go(context, event, State::connecting_error(), "grace period over");
                }
                let notifier = context.answer_notifier();
                context.ui.ask(Question::RetryConnecting, notifier);
            }
            context.timers.ssh_retry.start(context.options.timeouts.ssh_retry, &context.events);
        }

        match context.ui.status(Question::RetryConnecting) {
            QuestionStatus::Yes => {
                context.ui.dismiss_question(Question::RetryConnecting);
                context.grace_deadline = Instant::now() + context.ssh_params.connection_timeout();
            }
            QuestionStatus::No => return go(context, event, State::connecting_error(), "gave up"),
            QuestionStatus::NotAsked | QuestionStatus::Asked => {}
        }

        retry_when_due(context);
        Handled
    }

    #[action]
    fn enter_connecting(context: &mut Machine) {
        let boot = if context.vm_started_outside {
            None
        } else {
            context.boot_started_at
        };
        context.grace_deadline = boot.unwrap_or_else(Instant::now) + context.ssh_params.connection_timeout();
        context.ssh_last_error = None;
        context.try_connect();
    }

    #[action]
    fn exit_connecting(context: &mut Machine) {
        context.timers.ssh_retry.stop();
        context.ui.dismiss_question(Question::RetryConnecting);
        context.abandon_attempts();
    }

    #[state(entry_action = "enter_connecting_error", exit_action = "stop_retrying")]
    fn connecting_error(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_ready() {
            return go(context, event, State::not_connected(), "VM not running");
        }
        if closing_requested(context) {
            return go(context, event, State::disconnected(), "cancelled");
        }
        if context.ssh_connected {
            return go(context, event, State::connected(), "connected in the background");
        }
        if context.connect_requested {
            return go(context, event, State::connecting(), "retry requested");
        }
        if let Some(error) = context.ssh_attempt_error.take() {
            context.ssh_last_error = Some(error);
            context.timers.ssh_retry.start(context.options.timeouts.ssh_retry_slow, &context.events);
        }
        retry_when_due(context);
        Handled
    }

    #[action]
    fn enter_connecting_error(context: &mut Machine) {
        context.connect_requested = false;
        context.drop_session();
        context.timers.ssh_retry.start(context.options.timeouts.ssh_retry_slow, &context.events);
    }

    #[action]
    fn stop_retrying(context: &mut Machine) {
        context.timers.ssh_retry.stop();
        context.abandon_attempts();
    }

    #[state(entry_action = "enter_connected")]
    fn connected(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_ready() {
            return go(context, event, State::not_connected(), "VM not running");
        }
        if closing_requested(context) {
            return go(context, event, State::disconnecting(), "disconnect requested");
        }
        if let Some(reason) = context.ssh_lost.take() {
            context.ssh_last_error = Some(reason);
            return go(context, event, State::connection_lost(), "connection lost");
        }
        if std::mem::take(&mut context.ssh_params_changed) {
            return go(context, event, State::connecting(), "parameters changed");
        }
        Handled
    }

    #[action]
    fn enter_connected(context: &mut Machine) {
        context.connect_requested = false;
        context.ssh_last_error = None;
        context.start_guest_init();
    }

    #[state(entry_action = "enter_disconnecting")]
    fn disconnecting(context: &mut Machine, event: &Step) -> Outcome<State> {
        if context.ssh_closed || context.session.is_none() {
            return go(context, event, State::disconnected(), "closed");
        }
        if !context.vm_ready() {
            return go(context, event, State::not_connected(), "VM not running");
        }
        Handled
    }

    #[action]
    fn enter_disconnecting(context: &mut Machine) {
        match &context.session {
            Some(session) => session.disconnect(),
            None => context.ssh_closed = true,
        }
    }

    #[state(entry_action = "forget_session")]
    fn disconnected(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_ready() {
            return go(context, event, State::not_connected(), "VM not running");
        }
        if context.connect_requested && !closing_requested(context) {
            return go(context, event, State::connecting(), "connect requested");
        }
        Handled
    }

    #[state(entry_action = "enter_connection_lost", exit_action = "stop_retrying")]
    fn connection_lost(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_ready() {
            return go(context, event, State::not_connected(), "VM not running");
        }
        if closing_requested(context) {
            return go(context, event, State::disconnected(), "cancelled");
        }
        if context.ssh_connected {
            return go(context, event, State::connected(), "reconnected");
        }
        if let Some(error) = context.ssh_attempt_error.take() {
            context.ssh_last_error = Some(error);
            context.timers.ssh_retry.start(context.options.timeouts.ssh_retry, &context.events);
        }
        retry_when_due(context);
        Handled
    }

    #[action]
    fn enter_connection_lost(context: &mut Machine) {
        context.drop_session();
        context.timers.ssh_retry.start(context.options.timeouts.ssh_retry, &context.events);
    }
}

impl From<&State> for SshState {
    fn from(state: &State) -> Self {
        match state {
            State::NotConnected {} => SshState::NotConnected,
            State::Connecting {} => SshState::Connecting,
            State::ConnectingError {} => SshState::ConnectingError,
            State::Connected {} => SshState::Connected,
            State::Disconnecting {} => SshState::Disconnecting,
            State::Disconnected {} => SshState::Disconnected,
            State::ConnectionLost {} => SshState::ConnectionLost,
        }
    }
}

fn go(context: &Machine, step: &Step, to: State, reason: &str) -> Outcome<State> {
    info!(
        target: "ssh_sm",
        vm = %context.vm.name(),
        from = ?context.ssh_state,
        to = ?SshState::from(&to),
        round = step.round,
        reason,
        "transition"
    );
    Transition(to)
}

fn closing_requested(context: &Machine) -> bool {
    context.lock_down_requested || context.disconnect_requested
}

fn retry_when_due(context: &mut Machine) {
    if context.timers.ssh_retry.take_fired() && !context.ssh_attempt_in_flight {
        context.try_connect();
    }
}
