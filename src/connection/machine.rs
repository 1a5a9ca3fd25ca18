//! The connection actor.
//!
//! [`Machine`] owns all connection state and is driven by a single task
//! reading [`Event`]s. Asynchronous work (probes, VM operations, SSH
//! attempts, timers) runs in spawned tasks that post their outcome back as
//! an event, tagged with a generation so results from an abandoned attempt
//! are recognised and dropped.
//!
//! After every event the two statig machines ([`Machines`]) are stepped to
//! a fixed point with the [`Machine`] as their context ([`Machine::exec`]),
//! then the external state is recomputed and the pending operation, if any,
//! is checked for completion.

use std::future::Future;
use std::sync::Arc;

use statig::blocking::{IntoStateMachineExt, StateMachine};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::timer::{TimerKind, Timers};
use super::{ConnectOptions, ConnectionError, ConnectionEvent, ConnectionOptions, ConnectionStatus, Operation};
use crate::ssh::{SessionEnd, SshConnector, SshError, SshParameters, SshSession};
use crate::state_machine::ssh_sm::SshMachine;
use crate::state_machine::vm_sm::VmMachine;
use crate::state_machine::{SshState, State, Step, VmState, external_state};
use crate::ui::{AnswerNotifier, ConnectionUi, Warning};
use crate::vm::{BasicState, VirtualMachine, VmError};

/// Upper bound on step rounds per event. Both machines settle in a handful
/// of rounds; hitting the cap means a transition cycle.
const MAX_ROUNDS: usize = 64;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub(crate) type Reply = oneshot::Sender<Result<(), ConnectionError>>;

pub(crate) enum OperationRequest {
    Connect(ConnectOptions),
    Disconnect,
    LockDown,
    Release,
    Refresh,
}

impl OperationRequest {
    fn kind(&self) -> Operation {
        match self {
            OperationRequest::Connect(_) => Operation::Connect,
            OperationRequest::Disconnect => Operation::Disconnect,
            OperationRequest::LockDown => Operation::LockDown,
            OperationRequest::Release => Operation::Release,
            OperationRequest::Refresh => Operation::Refresh,
        }
    }
}

pub(crate) enum Request {
    Operation { op: OperationRequest, reply: Reply },
    SetSshParameters(SshParameters),
    SetAutoConnect(bool),
    SetApplicationActive(bool),
}

pub(crate) enum Event {
    Request(Request),
    Probed { seq: u64, result: Result<BasicState, String> },
    VmOpDone { generation: u64, result: Result<(), String> },
    SshAttempt { generation: u64, result: Result<SshSession, SshError> },
    SshEnded { generation: u64, end: SessionEnd },
    GuestInitDone { generation: u64, result: Result<(), String> },
    TimerFired(TimerKind, u64),
    /// A question posted to the UI has been answered.
    UiAnswer,
}

/// Post into the actor if it is still alive.
pub(crate) fn post(events: &mpsc::WeakUnboundedSender<Event>, event: Event) {
    if let Some(events) = events.upgrade() {
        let _ = events.send(event);
    }
}

// ---------------------------------------------------------------------------
// State machines
// ---------------------------------------------------------------------------

/// The VM and SSH machines. Kept outside [`Machine`], which both of them
/// borrow mutably as context while handling a step.
pub(crate) struct Machines {
    vm: StateMachine<VmMachine>,
    ssh: StateMachine<SshMachine>,
}

impl Machines {
    pub(crate) fn new() -> Self {
        Self {
            vm: VmMachine.state_machine(),
            ssh: SshMachine.state_machine(),
        }
    }

    /// Dispatch one step to the VM machine. Returns whether it changed state.
    fn step_vm(&mut self, machine: &mut Machine, round: usize) -> bool {
        let before = self.vm.state().clone();
        self.vm.handle_with_context(&Step { round }, machine);
        machine.vm_state = VmState::from(self.vm.state());
        *self.vm.state() != before
    }

    fn step_ssh(&mut self, machine: &mut Machine, round: usize) -> bool {
        let before = self.ssh.state().clone();
        self.ssh.handle_with_context(&Step { round }, machine);
        machine.ssh_state = SshState::from(self.ssh.state());
        *self.ssh.state() != before
    }
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

pub(crate) struct Machine {
    pub(crate) vm: Arc<dyn VirtualMachine>,
    pub(crate) ui: Arc<dyn ConnectionUi>,
    pub(crate) connector: Arc<dyn SshConnector>,
    pub(crate) ssh_params: SshParameters,
    pub(crate) options: ConnectionOptions,
    pub(crate) events: mpsc::WeakUnboundedSender<Event>,
    status_tx: watch::Sender<ConnectionStatus>,
    notify_tx: broadcast::Sender<ConnectionEvent>,

    // Positions of the two machines as of their last step.
    pub(crate) vm_state: VmState,
    pub(crate) ssh_state: SshState,
    state: State,
    error_string: String,
    vm_off: bool,

    // Requests
    pub(crate) connect_requested: bool,
    pub(crate) ask_start_vm: bool,
    pub(crate) connect_declined: bool,
    pub(crate) disconnect_requested: bool,
    pub(crate) connect_later_requested: bool,
    pub(crate) lock_down_requested: bool,
    pub(crate) lock_down_failed: bool,
    pub(crate) auto_connect: bool,
    application_active: bool,
    pending: Option<(Operation, Reply)>,

    // Last probe
    pub(crate) vm_probed: bool,
    pub(crate) vm_existing: bool,
    pub(crate) vm_running: bool,
    pub(crate) vm_vanished: bool,
    pub(crate) last_probe_error: Option<String>,
    probe_seq: u64,
    probe_in_flight: bool,
    probe_again: bool,
    last_probe_seq: u64,
    refresh_min_seq: u64,

    // VM machine scratch
    pub(crate) vm_started_outside: bool,
    pub(crate) vm_op_generation: u64,
    pub(crate) vm_op_result: Option<Result<(), String>>,
    pub(crate) vm_error: Option<String>,
    pub(crate) start_warning: Warning,
    pub(crate) boot_started_at: Option<Instant>,
    pub(crate) hard_close_attempts: u32,
    pub(crate) soft_close_terminator: Option<CancellationToken>,

    // SSH machine scratch
    pub(crate) session: Option<SshSession>,
    pub(crate) session_generation: u64,
    pub(crate) ssh_generation: u64,
    pub(crate) ssh_attempt_in_flight: bool,
    pub(crate) ssh_attempt_error: Option<String>,
    pub(crate) ssh_last_error: Option<String>,
    pub(crate) ssh_connected: bool,
    pub(crate) ssh_closed: bool,
    pub(crate) ssh_lost: Option<String>,
    pub(crate) ssh_params_changed: bool,
    pub(crate) grace_deadline: Instant,
    pub(crate) guest_initialized: bool,
    pub(crate) guest_init_generation: u64,
    pub(crate) guest_init_in_flight: bool,

    pub(crate) timers: Timers,
}

impl Machine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        vm: Arc<dyn VirtualMachine>,
        ui: Arc<dyn ConnectionUi>,
        connector: Arc<dyn SshConnector>,
        ssh_params: SshParameters,
        options: ConnectionOptions,
        events: mpsc::WeakUnboundedSender<Event>,
        status_tx: watch::Sender<ConnectionStatus>,
        notify_tx: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let auto_connect = options.auto_connect;
        Self {
            vm,
            ui,
            connector,
            ssh_params,
            options,
            events,
            status_tx,
            notify_tx,

            vm_state: VmState::Off,
            ssh_state: SshState::NotConnected,
            state: State::Disconnected,
            error_string: String::new(),
            vm_off: true,

            connect_requested: false,
            ask_start_vm: false,
            connect_declined: false,
            disconnect_requested: false,
            connect_later_requested: false,
            lock_down_requested: false,
            lock_down_failed: false,
            auto_connect,
            application_active: true,
            pending: None,

            vm_probed: false,
            vm_existing: false,
            vm_running: false,
            vm_vanished: false,
            last_probe_error: None,
            probe_seq: 0,
            probe_in_flight: false,
            probe_again: false,
            last_probe_seq: 0,
            refresh_min_seq: 0,

            vm_started_outside: false,
            vm_op_generation: 0,
            vm_op_result: None,
            vm_error: None,
            start_warning: Warning::StartFailed,
            boot_started_at: None,
            hard_close_attempts: 0,
            soft_close_terminator: None,

            session: None,
            session_generation: 0,
            ssh_generation: 0,
            ssh_attempt_in_flight: false,
            ssh_attempt_error: None,
            ssh_last_error: None,
            ssh_connected: false,
            ssh_closed: false,
            ssh_lost: None,
            ssh_params_changed: false,
            grace_deadline: Instant::now(),
            guest_initialized: false,
            guest_init_generation: 0,
            guest_init_in_flight: false,

            timers: Timers::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    fn handle(&mut self, event: Event) {
        match event {
            Event::Request(request) => self.handle_request(request),
            Event::Probed { seq, result } => self.on_probed(seq, result),
            Event::VmOpDone { generation, result } => {
                if generation == self.vm_op_generation {
                    if let Err(e) = &result {
                        warn!(vm = %self.vm.name(), state = ?self.vm_state, error = %e, "VM operation failed");
                    }
                    self.vm_op_result = Some(result);
                } else {
                    debug!(vm = %self.vm.name(), generation, "dropping stale VM operation result");
                }
                self.request_probe();
            }
            Event::SshAttempt { generation, result } => self.on_ssh_attempt(generation, result),
            Event::SshEnded { generation, end } => {
                if generation != self.session_generation {
                    return;
                }
                self.ssh_connected = false;
                match end {
                    SessionEnd::Closed => self.ssh_closed = true,
                    SessionEnd::Lost(_) if self.ssh_state == SshState::Disconnecting => self.ssh_closed = true,
                    SessionEnd::Lost(reason) => {
                        warn!(vm = %self.vm.name(), %reason, "SSH connection lost");
                        self.ssh_lost = Some(reason);
                    }
                }
            }
            Event::GuestInitDone { generation, result } => {
                if generation != self.guest_init_generation {
                    return;
                }
                self.guest_init_in_flight = false;
                self.guest_initialized = true;
                if let Err(e) = result {
                    warn!(vm = %self.vm.name(), error = %e, "guest initialization failed");
                }
            }
            Event::TimerFired(kind, generation) => {
                if self.timers.get_mut(kind).on_fired(generation) && kind == TimerKind::Poll {
                    self.request_probe();
                }
            }
            Event::UiAnswer => {}
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Operation { op, reply } => self.begin_operation(op, reply),
            Request::SetSshParameters(params) => {
                if params == self.ssh_params {
                    return;
                }
                info!(vm = %self.vm.name(), target = %params.target(), "SSH parameters changed");
                self.ssh_params = params;
                if self.ssh_state == SshState::Connected {
                    self.ssh_params_changed = true;
                }
            }
            Request::SetAutoConnect(auto_connect) => self.auto_connect = auto_connect,
            Request::SetApplicationActive(active) => {
                let activated = active && !self.application_active;
                self.application_active = active;
                if activated {
                    self.request_probe();
                }
            }
        }
    }

    fn begin_operation(&mut self, op: OperationRequest, reply: Reply) {
        let kind = op.kind();

        if self.lock_down_requested
            && matches!(kind, Operation::Connect | Operation::Disconnect | Operation::Refresh)
        {
            info!(vm = %self.vm.name(), operation = %kind, "rejected while locked down");
            self.ui.warn(Warning::VmLocked);
            let _ = reply.send(Err(ConnectionError::LockedDown));
            return;
        }

        if let Some((pending, _)) = &self.pending {
            let pending = *pending;
            info!(vm = %self.vm.name(), operation = %kind, %pending, "rejected while busy");
            match pending {
                Operation::Connect => self.ui.warn(Warning::AlreadyConnecting),
                Operation::Disconnect | Operation::LockDown => self.ui.warn(Warning::AlreadyClosing),
                Operation::Release | Operation::Refresh => {}
            }
            let _ = reply.send(Err(ConnectionError::Busy(pending)));
            return;
        }

        debug!(vm = %self.vm.name(), operation = %kind, "operation started");
        match op {
            OperationRequest::Connect(options) => {
                if self.state == State::Connected {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.connect_requested = true;
                self.connect_declined = false;
                self.ask_start_vm = options.ask_start_vm;
                self.disconnect_requested = false;
            }
            OperationRequest::Disconnect => {
                self.connect_requested = false;
                self.disconnect_requested = true;
            }
            OperationRequest::LockDown => {
                if self.locked_down() {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.lock_down_requested = true;
                self.lock_down_failed = false;
                if self.connect_requested || matches!(self.state, State::Connected | State::Connecting) {
                    self.connect_later_requested = true;
                }
                self.connect_requested = false;
                self.disconnect_requested = false;
            }
            OperationRequest::Release => {
                if self.lock_down_requested {
                    info!(vm = %self.vm.name(), "lock-down released");
                }
                self.lock_down_requested = false;
                if std::mem::take(&mut self.connect_later_requested) {
                    self.connect_requested = true;
                    self.connect_declined = false;
                    self.ask_start_vm = false;
                }
            }
            OperationRequest::Refresh => {
                self.refresh_min_seq = self.probe_seq + 1;
                self.request_probe();
            }
        }
        self.pending = Some((kind, reply));
    }

    fn on_probed(&mut self, seq: u64, result: Result<BasicState, String>) {
        self.probe_in_flight = false;
        self.last_probe_seq = seq;
        match result {
            Ok(state) => {
                let was_existing = self.vm_existing;
                self.vm_existing = state.is_existing();
                self.vm_running = state.is_running();
                if self.vm_probed && was_existing && !self.vm_existing {
                    warn!(vm = %self.vm.name(), "virtual machine disappeared");
                    self.vm_vanished = true;
                }
                self.vm_probed = true;
                self.last_probe_error = None;
            }
            Err(e) => {
                warn!(vm = %self.vm.name(), error = %e, "probe failed");
                self.last_probe_error = Some(e);
            }
        }
        if std::mem::take(&mut self.probe_again) {
            self.request_probe();
        }
    }

    fn on_ssh_attempt(&mut self, generation: u64, result: Result<SshSession, SshError>) {
        if generation != self.ssh_generation {
            // Abandoned attempt; a late session is dropped and thereby closed.
            debug!(vm = %self.vm.name(), generation, "dropping stale SSH attempt");
            return;
        }
        self.ssh_attempt_in_flight = false;
        match result {
            Ok(mut session) => {
                self.session_generation += 1;
                if let Some(ended) = session.take_end_signal() {
                    let generation = self.session_generation;
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let end = ended
                            .await
                            .unwrap_or_else(|_| SessionEnd::Lost("session went away".to_string()));
                        post(&events, Event::SshEnded { generation, end });
                    });
                }
                self.session = Some(session);
                self.ssh_connected = true;
                self.ssh_closed = false;
                self.ssh_lost = None;
            }
            Err(e) => {
                debug!(vm = %self.vm.name(), error = %e, "SSH attempt failed");
                self.ssh_attempt_error = Some(e.to_string());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    pub(crate) fn exec(&mut self, machines: &mut Machines) {
        let mut settled = false;
        for round in 0..MAX_ROUNDS {
            let mut changed = false;
            while machines.step_vm(self, round) {
                changed = true;
            }
            while machines.step_ssh(self, round) {
                changed = true;
            }
            if !changed {
                settled = true;
                break;
            }
        }
        if !settled {
            warn!(vm = %self.vm.name(), vm_state = ?self.vm_state, ssh_state = ?self.ssh_state, "state machines did not settle");
        }

        self.update_state();
        self.check_pending();
        self.update_polling();
    }

    fn update_state(&mut self) {
        let mut state = external_state(self.vm_state, self.ssh_state);
        if state == State::Connected && !self.guest_initialized {
            state = State::Connecting;
        }
        self.error_string = if state == State::Error {
            self.current_error()
        } else {
            String::new()
        };

        let locked_down = self.locked_down();
        if self.vm.core().is_locked_down() != locked_down {
            self.vm.core().set_locked_down(locked_down);
        }

        if state != self.state {
            info!(vm = %self.vm.name(), from = %self.state, to = %state, "connection state changed");
            self.state = state;
            let _ = self.notify_tx.send(ConnectionEvent::StateChanged(state));
        }

        let vm_off = matches!(
            self.vm_state,
            VmState::Off | VmState::AskBeforeStarting | VmState::Preparing | VmState::StartingError
        );
        if vm_off != self.vm_off {
            self.vm_off = vm_off;
            let _ = self.notify_tx.send(ConnectionEvent::VirtualMachineOffChanged(vm_off));
        }

        let status = ConnectionStatus {
            state,
            error_string: self.error_string.clone(),
            vm_off,
            locked_down,
            vm_state: self.vm_state,
            ssh_state: self.ssh_state,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn current_error(&self) -> String {
        if self.vm_state == VmState::StartingError {
            return self
                .vm_error
                .clone()
                .unwrap_or_else(|| "the virtual machine failed to start".to_string());
        }
        match &self.ssh_last_error {
            Some(e) => format!("could not connect over SSH: {e}"),
            None => "could not connect over SSH".to_string(),
        }
    }

    fn check_pending(&mut self) {
        let outcome = match self.pending.as_ref().map(|(op, _)| *op) {
            None => None,
            Some(Operation::Connect) => match self.state {
                State::Connected => Some(Ok(())),
                State::Error => Some(Err(ConnectionError::Failed(self.error_string.clone()))),
                _ if self.connect_declined => Some(Err(ConnectionError::Declined)),
                _ => None,
            },
            Some(Operation::Disconnect) => match self.vm_state {
                VmState::Off if self.vm_probed => Some(Ok(())),
                VmState::Zombie => Some(Err(ConnectionError::Failed(
                    "the virtual machine refused to close".to_string(),
                ))),
                // Closing a VM started outside was declined.
                VmState::Running
                    if !self.disconnect_requested
                        && matches!(self.ssh_state, SshState::NotConnected | SshState::Disconnected) =>
                {
                    Some(Ok(()))
                }
                _ => None,
            },
            Some(Operation::LockDown) => {
                if self.lock_down_failed {
                    Some(Err(ConnectionError::LockDownFailed))
                } else if self.locked_down() {
                    Some(Ok(()))
                } else {
                    None
                }
            }
            Some(Operation::Refresh) => (self.last_probe_seq >= self.refresh_min_seq).then(|| {
                match &self.last_probe_error {
                    Some(e) => Err(ConnectionError::Failed(e.clone())),
                    None => Ok(()),
                }
            }),
            Some(Operation::Release) => Some(Ok(())),
        };
        self.lock_down_failed = false;

        let Some(result) = outcome else {
            return;
        };
        let Some((op, reply)) = self.pending.take() else {
            return;
        };
        match &result {
            Ok(()) => info!(vm = %self.vm.name(), operation = %op, "operation finished"),
            Err(e) => warn!(vm = %self.vm.name(), operation = %op, error = %e, "operation failed"),
        }
        if op == Operation::Disconnect {
            self.disconnect_requested = false;
        }
        self.ui.dismiss_warning(Warning::AlreadyConnecting);
        self.ui.dismiss_warning(Warning::AlreadyClosing);
        let _ = reply.send(result);
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    fn update_polling(&mut self) {
        let transient = matches!(
            self.vm_state,
            VmState::Starting | VmState::SoftClosing | VmState::HardClosing
        );
        if !(self.application_active || self.pending.is_some() || transient) {
            self.timers.poll.stop();
            return;
        }
        let interval = if transient {
            self.options.timeouts.poll_fast
        } else {
            self.options.timeouts.poll_normal
        };
        if !self.timers.poll.is_active() || self.timers.poll.interval() != Some(interval) {
            self.timers.poll.start(interval, &self.events);
        }
    }

    pub(crate) fn request_probe(&mut self) {
        if self.probe_in_flight {
            self.probe_again = true;
            return;
        }
        self.probe_in_flight = true;
        self.probe_seq += 1;

        let seq = self.probe_seq;
        let vm = Arc::clone(&self.vm);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = vm.probe().await.map_err(|e| e.to_string());
            post(&events, Event::Probed { seq, result });
        });
    }

    // -----------------------------------------------------------------------
    // Helpers for the state machines
    // -----------------------------------------------------------------------

    /// Run a VM operation in the background. Its result lands in
    /// `vm_op_result` unless the VM machine has left the state meanwhile.
    pub(crate) fn spawn_vm_op<F, Fut>(&mut self, op: F)
    where
        F: FnOnce(Arc<dyn VirtualMachine>) -> Fut,
        Fut: Future<Output = Result<(), VmError>> + Send + 'static,
    {
        self.vm_op_generation += 1;
        self.vm_op_result = None;

        let generation = self.vm_op_generation;
        let events = self.events.clone();
        let fut = op(Arc::clone(&self.vm));
        tokio::spawn(async move {
            let result = fut.await.map_err(|e| e.to_string());
            post(&events, Event::VmOpDone { generation, result });
        });
    }

    /// Power the VM off and give it `hard_close` to go down. Counts as one
    /// attempt.
    pub(crate) fn begin_hard_close(&mut self) {
        self.hard_close_attempts += 1;
        self.spawn_vm_op(|vm| async move { vm.stop().await });
        self.timers.vm_state.start(self.options.timeouts.hard_close, &self.events);
    }

    /// Ask the guest to power itself off over SSH, through the VM's queue.
    pub(crate) fn spawn_soft_close(&mut self) {
        self.vm_op_generation += 1;
        self.vm_op_result = None;

        let runner = self.connector.shutdown_runner(&self.ssh_params);
        let handle = self.vm.core().queue().enqueue(runner);
        self.soft_close_terminator = Some(handle.terminator());

        let generation = self.vm_op_generation;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = handle.wait().await.map(|_| ()).map_err(|e| e.to_string());
            post(&events, Event::VmOpDone { generation, result });
        });
    }

    pub(crate) fn try_connect(&mut self) {
        self.drop_session();
        self.ssh_generation += 1;
        self.ssh_attempt_in_flight = true;
        self.ssh_attempt_error = None;

        let generation = self.ssh_generation;
        let connector = Arc::clone(&self.connector);
        let params = self.ssh_params.clone();
        let attempt_timeout = self.options.ssh_try_connect_timeout;
        let events = self.events.clone();
        debug!(vm = %self.vm.name(), target = %params.target(), generation, "SSH attempt");
        tokio::spawn(async move {
            let result = connector.connect(&params, attempt_timeout).await;
            post(&events, Event::SshAttempt { generation, result });
        });
    }

    /// Forget attempts in flight.
    pub(crate) fn abandon_attempts(&mut self) {
        self.ssh_generation += 1;
        self.ssh_attempt_in_flight = false;
        self.ssh_attempt_error = None;
    }

    pub(crate) fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.disconnect();
        }
        self.session_generation += 1;
        self.ssh_connected = false;
        self.ssh_closed = false;
        self.ssh_lost = None;
    }

    pub(crate) fn start_guest_init(&mut self) {
        if self.guest_initialized || self.guest_init_in_flight {
            return;
        }
        self.guest_init_in_flight = true;

        let generation = self.guest_init_generation;
        let vm = Arc::clone(&self.vm);
        let params = self.ssh_params.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = vm.initialize_guest(&params).await.map_err(|e| e.to_string());
            post(&events, Event::GuestInitDone { generation, result });
        });
    }

    pub(crate) fn reset_guest_init(&mut self) {
        self.guest_init_generation += 1;
        self.guest_init_in_flight = false;
        self.guest_initialized = false;
    }

    pub(crate) fn answer_notifier(&self) -> AnswerNotifier {
        let events = self.events.clone();
        AnswerNotifier::new(move || post(&events, Event::UiAnswer))
    }

    /// Give up on the current lock-down. The VM is left as it is.
    pub(crate) fn fail_lock_down(&mut self) {
        warn!(vm = %self.vm.name(), state = ?self.vm_state, "lock-down failed");
        self.lock_down_requested = false;
        self.connect_later_requested = false;
        self.lock_down_failed = true;
        let _ = self.notify_tx.send(ConnectionEvent::LockDownFailed);
    }

    /// Lock-down is in effect once the VM is known to be off.
    fn locked_down(&self) -> bool {
        self.lock_down_requested && self.vm_probed && self.vm_state == VmState::Off
    }

    pub(crate) fn vm_ready(&self) -> bool {
        self.vm_state == VmState::Running
    }
}

// ---------------------------------------------------------------------------
// Actor loop
// ---------------------------------------------------------------------------

pub(crate) async fn run(mut machine: Machine, mut events: mpsc::UnboundedReceiver<Event>) {
    info!(vm = %machine.vm.name(), "connection engine started");
    let mut machines = Machines::new();
    machine.request_probe();
    machine.exec(&mut machines);

    while let Some(event) = events.recv().await {
        machine.handle(event);
        machine.exec(&mut machines);
    }

    debug!(vm = %machine.vm.name(), "connection engine stopped");
}
