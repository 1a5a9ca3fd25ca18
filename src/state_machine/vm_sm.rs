//! VM lifecycle state machine.
//!
//! ```text
//! Off ──► [AskBeforeStarting] ──► Preparing ──► Starting ──► Running
//!  ▲                                   │            │          │
//!  │                                   └──► StartingError ◄────┘ (timeout, failure, vanished)
//!  │
//!  ├── Committing ◄── SoftClosing ──(error, timeout)──► HardClosing ──► Zombie
//!  │                                                      │    ▲
//!  └──────────────────────────────────────────────────────┘    └── retry while locking down
//! ```
//!
//! `Running` is also entered from `Off` whenever a probe finds the VM
//! running without our doing; such a VM is only closed after the user
//! agrees (`CloseVm`, or `ResetVm` for lock-down).
//!
//! The machine keeps no data of its own: every handler and action works on
//! the connection [`Machine`] handed in as context.

use statig::prelude::*;
use tracing::{info, warn};

use crate::connection::machine::Machine;
use crate::ui::{Question, QuestionStatus, Warning};

use super::{SshState, Step, VmState};

#[derive(Debug, Default)]
pub(crate) struct VmMachine;

#[state_machine(initial = "State::off()", state(derive(Debug, Clone, PartialEq)))]
impl VmMachine {
    #[state(entry_action = "enter_off")]
    fn off(context: &mut Machine, event: &Step) -> Outcome<State> {
        if context.vm_running {
            context.vm_started_outside = true;
            return go(context, event, State::running(), "started outside");
        }
        if context.lock_down_requested || !context.connect_requested {
            return Handled;
        }
        if !context.vm_probed {
            if let Some(error) = context.last_probe_error.clone() {
                context.vm_error = Some(error);
                return go(context, event, State::starting_error(), "VM state unknown");
            }
            return Handled;
        }
        if context.options.ssh_port_check && ssh_port_occupied(context.ssh_params.port) {
            context.vm_error = Some(format!("SSH port {} is already in use", context.ssh_params.port));
            context.start_warning = Warning::SshPortOccupied;
            return go(context, event, State::starting_error(), "SSH port occupied");
        }
        if context.ask_start_vm && context.ui.should_ask(Question::StartVm) {
            return go(context, event, State::ask_before_starting(), "connect requested");
        }
        go(context, event, State::preparing(), "connect requested")
    }

    #[action]
    fn enter_off(context: &mut Machine) {
        context.vm_started_outside = false;
        context.disconnect_requested = false;
        context.boot_started_at = None;
    }

    #[state(entry_action = "enter_ask_before_starting", exit_action = "exit_ask_before_starting")]
    fn ask_before_starting(context: &mut Machine, event: &Step) -> Outcome<State> {
        if context.vm_running {
            context.vm_started_outside = true;
            return go(context, event, State::running(), "started outside");
        }
        if context.lock_down_requested || !context.connect_requested {
            return go(context, event, State::off(), "start no longer wanted");
        }
        match context.ui.status(Question::StartVm) {
            QuestionStatus::Yes => go(context, event, State::preparing(), "start confirmed"),
            QuestionStatus::No => {
                context.connect_requested = false;
                context.connect_declined = true;
                go(context, event, State::off(), "start declined")
            }
            QuestionStatus::NotAsked | QuestionStatus::Asked => Handled,
        }
    }

    #[action]
    fn enter_ask_before_starting(context: &mut Machine) {
        let notifier = context.answer_notifier();
        context.ui.ask(Question::StartVm, notifier);
    }

    #[action]
    fn exit_ask_before_starting(context: &mut Machine) {
        context.ui.dismiss_question(Question::StartVm);
    }

    #[state(entry_action = "enter_preparing")]
    fn preparing(context: &mut Machine, event: &Step) -> Outcome<State> {
        if context.vm_running {
            return go(context, event, State::running(), "came up while preparing");
        }
        if context.lock_down_requested || context.disconnect_requested {
            return go(context, event, State::off(), "start no longer wanted");
        }
        match context.vm_op_result.take() {
            Some(Ok(())) => go(context, event, State::starting(), "prepared"),
            Some(Err(error)) => {
                context.vm_error = Some(error);
                go(context, event, State::starting_error(), "preparation failed")
            }
            None => Handled,
        }
    }

    #[action]
    fn enter_preparing(context: &mut Machine) {
        context.vm_error = None;
        context.spawn_vm_op(|vm| async move { vm.prepare_to_start().await });
    }

    #[state(entry_action = "enter_starting", exit_action = "exit_starting")]
    fn starting(context: &mut Machine, event: &Step) -> Outcome<State> {
        if context.vm_running {
            return go(context, event, State::running(), "running");
        }
        if context.vm_vanished {
            context.vm_error = Some(format!("virtual machine {} no longer exists", context.vm.name()));
            return go(context, event, State::starting_error(), "vanished");
        }
        if let Some(Err(error)) = &context.vm_op_result {
            context.vm_error = Some(error.clone());
            return go(context, event, State::starting_error(), "start failed");
        }
        if context.timers.vm_state.has_fired() {
            context.vm_error = Some(format!(
                "virtual machine did not start within {}s",
                context.options.timeouts.vm_start.as_secs()
            ));
            return go(context, event, State::starting_error(), "start timed out");
        }
        Handled
    }

    #[action]
    fn enter_starting(context: &mut Machine) {
        context.connect_later_requested = false;
        context.vm_vanished = false;
        context.boot_started_at = Some(tokio::time::Instant::now());
        context.spawn_vm_op(|vm| async move { vm.start().await });
        context.timers.vm_state.start(context.options.timeouts.vm_start, &context.events);
    }

    #[action]
    fn exit_starting(context: &mut Machine) {
        context.timers.vm_state.stop();
    }

    #[state(entry_action = "enter_starting_error", exit_action = "exit_starting_error")]
    fn starting_error(context: &mut Machine, event: &Step) -> Outcome<State> {
        if context.vm_running {
            return go(context, event, State::running(), "came up late");
        }
        if context.connect_requested {
            return go(context, event, State::off(), "retry requested");
        }
        if context.disconnect_requested || context.lock_down_requested {
            return go(context, event, State::off(), "start abandoned");
        }
        Handled
    }

    #[action]
    fn enter_starting_error(context: &mut Machine) {
        context.connect_requested = false;
        context.connect_later_requested = false;
        context.ui.warn(context.start_warning);
    }

    #[action]
    fn exit_starting_error(context: &mut Machine) {
        context.ui.dismiss_warning(context.start_warning);
        context.start_warning = Warning::StartFailed;
    }

    #[state(entry_action = "enter_running", exit_action = "exit_running")]
    fn running(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_running {
            return go(context, event, State::off(), "powered off");
        }
        if !(context.lock_down_requested || context.disconnect_requested) {
            return Handled;
        }
        // SSH goes first.
        if !matches!(context.ssh_state, SshState::NotConnected | SshState::Disconnected) {
            return Handled;
        }
        if !context.vm_started_outside {
            let reason = if context.lock_down_requested {
                "locking down"
            } else {
                "disconnect requested"
            };
            return go(context, event, State::soft_closing(), reason);
        }

        let question = if context.lock_down_requested {
            Question::ResetVm
        } else {
            Question::CloseVm
        };
        let status = match context.ui.status(question) {
            QuestionStatus::NotAsked if !context.ui.should_ask(question) => {
                // Lock-down cannot proceed with the VM running; a plain
                // disconnect leaves a VM it did not start alone.
                if question == Question::ResetVm {
                    QuestionStatus::Yes
                } else {
                    QuestionStatus::No
                }
            }
            status => status,
        };
        match status {
            QuestionStatus::NotAsked => {
                let notifier = context.answer_notifier();
                context.ui.ask(question, notifier);
                Handled
            }
            QuestionStatus::Asked => Handled,
            QuestionStatus::Yes => {
                context.ui.dismiss_question(question);
                go(context, event, State::soft_closing(), "close confirmed")
            }
            QuestionStatus::No => {
                context.ui.dismiss_question(question);
                if context.lock_down_requested {
                    context.fail_lock_down();
                } else {
                    info!(target: "vm_sm", vm = %context.vm.name(), "leaving externally started VM running");
                    context.disconnect_requested = false;
                }
                Handled
            }
        }
    }

    #[action]
    fn enter_running(context: &mut Machine) {
        context.hard_close_attempts = 0;
        context.reset_guest_init();
    }

    #[action]
    fn exit_running(context: &mut Machine) {
        context.ui.dismiss_question(Question::CloseVm);
        context.ui.dismiss_question(Question::ResetVm);
    }

    #[state(entry_action = "enter_soft_closing", exit_action = "exit_soft_closing")]
    fn soft_closing(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_running {
            return go(context, event, State::committing(), "powered off");
        }
        if let Some(Err(error)) = &context.vm_op_result {
            warn!(target: "vm_sm", vm = %context.vm.name(), %error, "soft close failed");
            return go(context, event, State::hard_closing(), "soft close failed");
        }
        if context.timers.vm_state.has_fired() {
            return go(context, event, State::hard_closing(), "soft close timed out");
        }
        Handled
    }

    #[action]
    fn enter_soft_closing(context: &mut Machine) {
        context.hard_close_attempts = 0;
        context.spawn_soft_close();
        context.timers.vm_state.start(context.options.timeouts.soft_close, &context.events);
    }

    #[action]
    fn exit_soft_closing(context: &mut Machine) {
        context.timers.vm_state.stop();
        if let Some(terminator) = context.soft_close_terminator.take() {
            terminator.cancel();
        }
    }

    #[state(entry_action = "enter_hard_closing", exit_action = "exit_hard_closing")]
    fn hard_closing(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_running {
            return go(context, event, State::committing(), "powered off");
        }
        let failed = matches!(context.vm_op_result, Some(Err(_)));
        if !context.lock_down_requested {
            if failed || context.timers.vm_state.has_fired() {
                return go(context, event, State::zombie(), "refused to power off");
            }
            return Handled;
        }

        // Lock-down keeps trying, one attempt per timeout, even when the
        // stop command fails straight away.
        if !context.timers.vm_state.has_fired() {
            return Handled;
        }
        if context.hard_close_attempts < context.options.hard_close_attempts {
            info!(target: "vm_sm", vm = %context.vm.name(), attempt = context.hard_close_attempts + 1, "retrying power off");
            context.begin_hard_close();
            return Handled;
        }
        match context.ui.status(Question::RetryLockingDown) {
            QuestionStatus::NotAsked => {
                let notifier = context.answer_notifier();
                context.ui.ask(Question::RetryLockingDown, notifier);
                Handled
            }
            QuestionStatus::Asked => Handled,
            QuestionStatus::Yes => {
                info!(target: "vm_sm", vm = %context.vm.name(), "retry confirmed");
                context.ui.dismiss_question(Question::RetryLockingDown);
                context.begin_hard_close();
                Handled
            }
            QuestionStatus::No => {
                context.fail_lock_down();
                go(context, event, State::zombie(), "gave up locking down")
            }
        }
    }

    #[action]
    fn enter_hard_closing(context: &mut Machine) {
        context.begin_hard_close();
    }

    #[action]
    fn exit_hard_closing(context: &mut Machine) {
        context.timers.vm_state.stop();
        context.ui.dismiss_question(Question::RetryLockingDown);
    }

    #[state(entry_action = "enter_committing")]
    fn committing(context: &mut Machine, event: &Step) -> Outcome<State> {
        match context.vm_op_result.take() {
            Some(Ok(())) => go(context, event, State::off(), "committed"),
            Some(Err(error)) => {
                warn!(target: "vm_sm", vm = %context.vm.name(), %error, "commit failed");
                go(context, event, State::off(), "commit failed")
            }
            None => Handled,
        }
    }

    #[action]
    fn enter_committing(context: &mut Machine) {
        context.spawn_vm_op(|vm| async move { vm.commit_after_stop().await });
    }

    #[state(entry_action = "enter_zombie", exit_action = "exit_zombie")]
    fn zombie(context: &mut Machine, event: &Step) -> Outcome<State> {
        if !context.vm_running {
            return go(context, event, State::off(), "powered off");
        }
        if context.connect_requested || context.lock_down_requested || context.disconnect_requested {
            return go(context, event, State::running(), "new request");
        }
        Handled
    }

    #[action]
    fn enter_zombie(context: &mut Machine) {
        context.disconnect_requested = false;
        context.ui.warn(Warning::UnableToCloseVm);
    }

    #[action]
    fn exit_zombie(context: &mut Machine) {
        context.ui.dismiss_warning(Warning::UnableToCloseVm);
    }
}

impl From<&State> for VmState {
    fn from(state: &State) -> Self {
        match state {
            State::Off {} => VmState::Off,
            State::AskBeforeStarting {} => VmState::AskBeforeStarting,
            State::Preparing {} => VmState::Preparing,
            State::Starting {} => VmState::Starting,
            State::StartingError {} => VmState::StartingError,
            State::Running {} => VmState::Running,
            State::SoftClosing {} => VmState::SoftClosing,
            State::HardClosing {} => VmState::HardClosing,
            State::Committing {} => VmState::Committing,
            State::Zombie {} => VmState::Zombie,
        }
    }
}

/// Log a transition and drop whatever the state being left still has
/// running. Exit and entry actions run once statig takes the transition.
fn go(context: &mut Machine, step: &Step, to: State, reason: &str) -> Outcome<State> {
    info!(
        target: "vm_sm",
        vm = %context.vm.name(),
        from = ?context.vm_state,
        to = ?VmState::from(&to),
        round = step.round,
        reason,
        "transition"
    );
    context.vm_op_generation += 1;
    context.vm_op_result = None;
    Transition(to)
}

/// Whether something already listens on the SSH host port.
fn ssh_port_occupied(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_err()
}
