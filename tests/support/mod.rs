//! Scripted VM, SSH connector and UI for driving the connection engine
//! without VirtualBox, docker or sshd.

#![allow(dead_code)]

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use vmlink::command::{CommandError, CommandOutput, CommandQueue, CommandResult, CommandRunner};
use vmlink::connection::{ConnectionEvent, ConnectionOptions, State, VmConnection};
use vmlink::ssh::{SessionEnd, SshConnector, SshError, SshParameters, SshSession};
use vmlink::ui::{AnswerPolicy, HeadlessUi};
use vmlink::vm::{
    BackendKind, BasicState, FetchFlags, PortForwardingRule, ReservedPort, ReservedPortList, SharedPath, VideoMode,
    VirtualMachine, VirtualMachineInfo, VmCore, VmError,
};

// ---------------------------------------------------------------------------
// Virtual machine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockVmState {
    pub exists: bool,
    pub running: bool,
    /// `start` powers the VM on.
    pub start_powers_on: bool,
    /// `stop` powers the VM off.
    pub stop_powers_off: bool,
    pub fail_start: bool,
    /// `stop` errors out without touching the VM.
    pub fail_stop: bool,
    pub probes: usize,
    pub calls: Vec<String>,
}

impl Default for MockVmState {
    fn default() -> Self {
        Self {
            exists: true,
            running: false,
            start_powers_on: true,
            stop_powers_off: true,
            fail_start: false,
            fail_stop: false,
            probes: 0,
            calls: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct MockVm {
    core: VmCore,
    pub state: Arc<Mutex<MockVmState>>,
}

impl MockVm {
    pub fn new(state: MockVmState) -> Arc<Self> {
        Arc::new(Self {
            core: VmCore::new("mock", CommandQueue::new()),
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| c.as_str() == call).count()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().calls.push(call.into());
    }

    fn mutate(&self, operation: &'static str, call: String) -> Result<(), VmError> {
        self.core.ensure_mutable(operation)?;
        self.record(call);
        Ok(())
    }
}

#[async_trait]
impl VirtualMachine for MockVm {
    fn core(&self) -> &VmCore {
        &self.core
    }

    fn kind(&self) -> BackendKind {
        BackendKind::VirtualBox
    }

    async fn probe(&self) -> Result<BasicState, VmError> {
        let mut state = self.state.lock();
        state.probes += 1;
        let mut basic = BasicState::empty();
        if state.exists {
            basic = basic | BasicState::EXISTING | BasicState::HEADLESS;
        }
        if state.running {
            basic = basic | BasicState::RUNNING;
        }
        Ok(basic)
    }

    async fn fetch_info(&self, _flags: FetchFlags) -> Result<VirtualMachineInfo, VmError> {
        Ok(self.core.cached_info())
    }

    async fn prepare_to_start(&self) -> Result<(), VmError> {
        self.record("prepare");
        Ok(())
    }

    async fn start(&self) -> Result<(), VmError> {
        let mut state = self.state.lock();
        state.calls.push("start".to_string());
        if state.fail_start {
            return Err(VmError::Invalid("start refused".to_string()));
        }
        if state.start_powers_on {
            state.exists = true;
            state.running = true;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), VmError> {
        let mut state = self.state.lock();
        state.calls.push("stop".to_string());
        if state.fail_stop {
            return Err(VmError::Invalid("poweroff refused".to_string()));
        }
        if state.stop_powers_off {
            state.running = false;
        }
        Ok(())
    }

    async fn commit_after_stop(&self) -> Result<(), VmError> {
        self.record("commit");
        Ok(())
    }

    async fn initialize_guest(&self, _ssh: &SshParameters) -> Result<(), VmError> {
        self.record("init-guest");
        Ok(())
    }

    async fn set_shared_path(&self, which: SharedPath, host_path: &Path) -> Result<(), VmError> {
        self.mutate("set shared path", format!("share {which} {}", host_path.display()))
    }

    async fn set_reserved_port_forwarding(&self, which: ReservedPort, host_port: u16) -> Result<(), VmError> {
        self.mutate("set port forwarding", format!("reserve {} {host_port}", which.rule_name()))
    }

    async fn set_reserved_port_list_forwarding(&self, which: ReservedPortList, ports: &[u16]) -> Result<(), VmError> {
        self.mutate("set port forwarding", format!("port-list {which} {ports:?}"))
    }

    async fn add_port_forwarding(&self, rule: &PortForwardingRule) -> Result<(), VmError> {
        self.mutate("add port forwarding", format!("forward {}", rule.name))
    }

    async fn remove_port_forwarding(&self, rule_name: &str) -> Result<(), VmError> {
        self.mutate("remove port forwarding", format!("unforward {rule_name}"))
    }

    async fn set_video_mode(&self, mode: VideoMode) -> Result<(), VmError> {
        self.mutate("set video mode", format!("video {mode}"))
    }

    async fn set_memory_size_mb(&self, memory_mb: u32) -> Result<(), VmError> {
        self.mutate("set memory size", format!("memory {memory_mb}"))
    }

    async fn set_cpu_count(&self, cpu_count: u32) -> Result<(), VmError> {
        self.mutate("set cpu count", format!("cpus {cpu_count}"))
    }

    async fn set_storage_size_mb(&self, storage_mb: u64) -> Result<(), VmError> {
        self.mutate("set storage size", format!("storage {storage_mb}"))
    }

    async fn take_snapshot(&self, name: &str) -> Result<(), VmError> {
        self.mutate("take snapshot", format!("snapshot {name}"))
    }

    async fn restore_snapshot(&self, name: &str) -> Result<(), VmError> {
        self.mutate("restore snapshot", format!("restore {name}"))
    }

    async fn remove_snapshot(&self, name: &str) -> Result<(), VmError> {
        self.mutate("remove snapshot", format!("remove {name}"))
    }
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ConnectorState {
    attempts: u32,
    failures_left: u32,
    /// Attempts that time out before anything else is checked.
    timeouts_left: u32,
    /// The guest shutdown cannot reach sshd.
    shutdown_unreachable: bool,
    /// Cancelled to simulate the network dropping live sessions.
    losses: Vec<CancellationToken>,
}

/// Connects whenever the mock VM runs, after `failures` refused attempts.
/// Its guest shutdown powers the VM off only if `shutdown_powers_off`.
#[derive(Clone)]
pub struct MockConnector {
    vm: Arc<Mutex<MockVmState>>,
    state: Arc<Mutex<ConnectorState>>,
    shutdown_powers_off: bool,
}

impl MockConnector {
    pub fn new(vm: &MockVm, failures: u32, shutdown_powers_off: bool) -> Arc<Self> {
        Arc::new(Self {
            vm: Arc::clone(&vm.state),
            state: Arc::new(Mutex::new(ConnectorState {
                failures_left: failures,
                ..ConnectorState::default()
            })),
            shutdown_powers_off,
        })
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Let the next `count` attempts time out.
    pub fn time_out_next(&self, count: u32) {
        self.state.lock().timeouts_left = count;
    }

    /// Make the guest shutdown fail to connect.
    pub fn refuse_shutdown(&self) {
        self.state.lock().shutdown_unreachable = true;
    }

    /// Drop every live session as if the network went away.
    pub fn lose_connections(&self) {
        for loss in self.state.lock().losses.drain(..) {
            loss.cancel();
        }
    }
}

#[async_trait]
impl SshConnector for MockConnector {
    async fn connect(&self, params: &SshParameters, _attempt_timeout: Duration) -> Result<SshSession, SshError> {
        let refused = |message: &str| SshError::Failed {
            target: params.target(),
            message: message.to_string(),
        };
        {
            let mut state = self.state.lock();
            state.attempts += 1;
            if state.timeouts_left > 0 {
                state.timeouts_left -= 1;
                return Err(SshError::Timeout {
                    target: params.target(),
                });
            }
            if !self.vm.lock().running {
                return Err(refused("connection refused"));
            }
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(refused("connection reset by peer"));
            }
        }

        let (control, session) = SshSession::channel();
        let loss = CancellationToken::new();
        self.state.lock().losses.push(loss.clone());
        tokio::spawn(async move {
            let end = tokio::select! {
                _ = control.stop.cancelled() => SessionEnd::Closed,
                _ = loss.cancelled() => SessionEnd::Lost("broken pipe".to_string()),
            };
            let _ = control.ended.send(end);
        });
        Ok(session)
    }

    fn shutdown_runner(&self, params: &SshParameters) -> Box<dyn CommandRunner> {
        Box::new(MockShutdown {
            vm: Arc::clone(&self.vm),
            powers_off: self.shutdown_powers_off,
            unreachable: self.state.lock().shutdown_unreachable.then(|| params.target()),
        })
    }
}

/// Guest shutdown: powers the mock off, hangs until terminated, or fails
/// to connect to `unreachable`.
struct MockShutdown {
    vm: Arc<Mutex<MockVmState>>,
    powers_off: bool,
    unreachable: Option<String>,
}

impl fmt::Display for MockShutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[mock] poweroff")
    }
}

#[async_trait]
impl CommandRunner for MockShutdown {
    async fn run(&mut self, cancel: CancellationToken) -> CommandResult {
        if let Some(target) = &self.unreachable {
            self.vm.lock().calls.push("shutdown unreachable".to_string());
            return Err(CommandError::Connection {
                target: target.clone(),
                stderr: "ssh: connect to host 127.0.0.1 port 2222: Connection refused".to_string(),
            });
        }
        {
            let mut vm = self.vm.lock();
            vm.calls.push("shutdown".to_string());
            if self.powers_off {
                vm.running = false;
            }
        }
        if self.powers_off {
            return Ok(CommandOutput::default());
        }
        cancel.cancelled().await;
        Err(CommandError::Terminated {
            command: self.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub fn test_options() -> ConnectionOptions {
    ConnectionOptions {
        ssh_port_check: false,
        ..ConnectionOptions::default()
    }
}

pub struct Harness {
    pub vm: Arc<MockVm>,
    pub connector: Arc<MockConnector>,
    pub ui: HeadlessUi,
    pub connection: VmConnection,
}

impl Harness {
    pub fn new(vm: MockVmState, ssh_failures: u32, shutdown_powers_off: bool, policy: AnswerPolicy) -> Self {
        Self::with_options(vm, ssh_failures, shutdown_powers_off, policy, test_options())
    }

    pub fn with_options(
        vm: MockVmState,
        ssh_failures: u32,
        shutdown_powers_off: bool,
        policy: AnswerPolicy,
        options: ConnectionOptions,
    ) -> Self {
        let vm = MockVm::new(vm);
        let connector = MockConnector::new(&vm, ssh_failures, shutdown_powers_off);
        let ui = HeadlessUi::new(policy);
        let connection = VmConnection::new(
            vm.clone(),
            Arc::new(ui.clone()),
            connector.clone(),
            SshParameters::default(),
            options,
        );
        Self {
            vm,
            connector,
            ui,
            connection,
        }
    }
}

/// External states from a batch of engine events, in order.
pub fn state_changes(events: &[ConnectionEvent]) -> Vec<State> {
    events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

/// Everything broadcast so far.
pub fn drain(events: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
