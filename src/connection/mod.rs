//! Connection engine: one [`VmConnection`] per virtual machine.
//!
//! The handle is cheap to clone. All state lives in a single actor task that
//! owns the VM and SSH state machines (see [`crate::state_machine`]) and
//! processes one event at a time, so no two operations ever interleave.
//!
//! ```rust,ignore
//! let connection = VmConnection::new(vm, ui, connector, config.ssh, options);
//! connection.connect_to(ConnectOptions { ask_start_vm: true }).await?;
//!
//! connection.lock_down(true).await?;
//! connection.virtual_machine().set_memory_size_mb(4096).await?;
//! connection.lock_down(false).await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::ssh::{SshConnector, SshParameters, try_connect_timeout_from_env};
use crate::ui::ConnectionUi;
use crate::vm::VirtualMachine;

pub(crate) mod machine;
pub(crate) mod timer;

pub use crate::state_machine::{SshState, State, VmState};

use machine::{Event, Machine, OperationRequest, Request};

/// Disables the pre-start check that the SSH host port is free.
pub const NO_SSH_PORT_CHECK_ENV: &str = "VMLINK_NO_SSH_PORT_CHECK";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Connect,
    Disconnect,
    LockDown,
    Release,
    Refresh,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::LockDown => "lock down",
            Operation::Release => "release",
            Operation::Refresh => "refresh",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("the virtual machine is locked down")]
    LockedDown,

    #[error("another operation is in progress: {0}")]
    Busy(Operation),

    #[error("{0}")]
    Failed(String),

    #[error("failed to lock down the virtual machine")]
    LockDownFailed,

    #[error("declined by the user")]
    Declined,

    #[error("the connection engine has shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Ask before starting a VM that is off.
    pub ask_start_vm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub vm_start: Duration,
    pub soft_close: Duration,
    pub hard_close: Duration,
    /// Poll interval while starting or closing.
    pub poll_fast: Duration,
    pub poll_normal: Duration,
    pub ssh_retry: Duration,
    /// Background retry interval after giving up on a connection.
    pub ssh_retry_slow: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            vm_start: Duration::from_secs(20),
            soft_close: Duration::from_secs(20),
            hard_close: Duration::from_secs(20),
            poll_fast: Duration::from_millis(1000),
            poll_normal: Duration::from_millis(10_000),
            ssh_retry: Duration::from_millis(1000),
            ssh_retry_slow: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Connect whenever the VM is seen running.
    pub auto_connect: bool,
    pub ssh_try_connect_timeout: Duration,
    /// Refuse to start the VM while something else listens on the SSH port.
    pub ssh_port_check: bool,
    /// Power-off attempts made during lock-down before asking the user.
    pub hard_close_attempts: u32,
    pub timeouts: Timeouts,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_connect: false,
            ssh_try_connect_timeout: crate::ssh::DEFAULT_TRY_CONNECT_TIMEOUT,
            ssh_port_check: true,
            hard_close_attempts: 2,
            timeouts: Timeouts::default(),
        }
    }
}

impl ConnectionOptions {
    /// Defaults with the `VMLINK_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            ssh_try_connect_timeout: try_connect_timeout_from_env(),
            ssh_port_check: std::env::var_os(NO_SSH_PORT_CHECK_ENV).is_none(),
            ..Self::default()
        }
    }
}

/// Broadcast to [`VmConnection::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(State),
    VirtualMachineOffChanged(bool),
    /// A lock-down could not power the VM off.
    LockDownFailed,
}

/// Snapshot published after every processed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: State,
    /// Set while `state` is [`State::Error`].
    pub error_string: String,
    pub vm_off: bool,
    pub locked_down: bool,
    pub vm_state: VmState,
    pub ssh_state: SshState,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: State::Disconnected,
            error_string: String::new(),
            vm_off: true,
            locked_down: false,
            vm_state: VmState::Off,
            ssh_state: SshState::NotConnected,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to the connection engine of one VM.
///
/// The engine stops once every handle is dropped.
#[derive(Clone)]
pub struct VmConnection {
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<ConnectionStatus>,
    notifications: broadcast::Sender<ConnectionEvent>,
    vm: Arc<dyn VirtualMachine>,
}

impl fmt::Debug for VmConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmConnection")
            .field("vm", &self.vm.name())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl VmConnection {
    /// Spawn the engine. Must be called from within a tokio runtime.
    pub fn new(
        vm: Arc<dyn VirtualMachine>,
        ui: Arc<dyn ConnectionUi>,
        connector: Arc<dyn SshConnector>,
        ssh_params: SshParameters,
        options: ConnectionOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (notify_tx, _) = broadcast::channel(64);

        let machine = Machine::new(
            Arc::clone(&vm),
            ui,
            connector,
            ssh_params,
            options,
            events_tx.downgrade(),
            status_tx,
            notify_tx.clone(),
        );
        tokio::spawn(machine::run(machine, events_rx));

        Self {
            events: events_tx,
            status: status_rx,
            notifications: notify_tx,
            vm,
        }
    }

    pub fn virtual_machine(&self) -> &Arc<dyn VirtualMachine> {
        &self.vm
    }

    /// Start the VM if needed and establish SSH.
    ///
    /// Resolves once connected, or with the reason it will not be.
    pub async fn connect_to(&self, options: ConnectOptions) -> Result<(), ConnectionError> {
        self.operation(OperationRequest::Connect(options)).await
    }

    /// Drop SSH and close the VM. A VM started outside is only closed after
    /// the user agrees.
    pub async fn disconnect_from(&self) -> Result<(), ConnectionError> {
        self.operation(OperationRequest::Disconnect).await
    }

    /// `true` powers the VM off and keeps it off so its settings can be
    /// changed; competing requests fail with [`ConnectionError::LockedDown`]
    /// until released with `false`. A connection interrupted by lock-down is
    /// re-established on release.
    pub async fn lock_down(&self, lock: bool) -> Result<(), ConnectionError> {
        let request = if lock {
            OperationRequest::LockDown
        } else {
            OperationRequest::Release
        };
        self.operation(request).await
    }

    /// Re-probe the VM right away.
    pub async fn refresh(&self) -> Result<(), ConnectionError> {
        self.operation(OperationRequest::Refresh).await
    }

    /// Takes effect on the next connection attempt; an established
    /// connection reconnects with the new parameters.
    pub fn set_ssh_parameters(&self, params: SshParameters) {
        self.send(Request::SetSshParameters(params));
    }

    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.send(Request::SetAutoConnect(auto_connect));
    }

    /// While inactive, a settled VM is not polled.
    pub fn set_application_active(&self, active: bool) {
        self.send(Request::SetApplicationActive(active));
    }

    pub fn state(&self) -> State {
        self.status.borrow().state
    }

    pub fn error_string(&self) -> String {
        self.status.borrow().error_string.clone()
    }

    pub fn is_virtual_machine_off(&self) -> bool {
        self.status.borrow().vm_off
    }

    pub fn is_locked_down(&self) -> bool {
        self.status.borrow().locked_down
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.notifications.subscribe()
    }

    async fn operation(&self, op: OperationRequest) -> Result<(), ConnectionError> {
        let (reply, result) = oneshot::channel();
        self.send(Request::Operation { op, reply });
        result.await.unwrap_or(Err(ConnectionError::Closed))
    }

    fn send(&self, request: Request) {
        // The actor only goes away with the runtime.
        let _ = self.events.send(Event::Request(request));
    }
}
