//! Virtual machine backends.
//!
//! A [`VirtualMachine`] is a handle to one named VM managed by an external
//! tool. Every operation is expressed as runners queued on the shared
//! [`CommandQueue`], so two backends never talk to their tools concurrently.
//!
//! Configuration changes (ports, shared paths, memory, ...) are only allowed
//! while the owning connection holds the VM locked down; the backend checks
//! [`VmCore::ensure_mutable`] and rejects the call otherwise.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::command::{CommandError, CommandOutput, CommandQueue, CommandRunner};
use crate::config::VmSettings;
use crate::ssh::SshParameters;

pub mod docker;
pub mod shared_path;
pub mod virtualbox;

pub use docker::Docker;
pub use shared_path::SharedPath;
pub use virtualbox::VirtualBox;

/// Upper bound on the length of a reserved port list.
pub const MAX_RESERVED_PORT_LIST: usize = 10;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("virtual machine \"{0}\" does not exist")]
    NotFound(String),

    #[error("cannot {operation} \"{vm}\" while it is not locked down")]
    NotLockedDown { vm: String, operation: &'static str },

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: BackendKind,
        operation: &'static str,
    },

    #[error("too many {list} ports: {count} given, at most {max} allowed", max = MAX_RESERVED_PORT_LIST)]
    TooManyPorts { list: ReservedPortList, count: usize },

    #[error("no port forwarding rule named \"{0}\"")]
    NoSuchRule(String),

    #[error("invalid value: {0}")]
    Invalid(String),

    #[error("unexpected output from {tool}: {message}")]
    Parse { tool: &'static str, message: String },

    #[error("state file {path}: {message}")]
    State { path: PathBuf, message: String },
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Result of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BasicState(u8);

impl BasicState {
    pub const EXISTING: BasicState = BasicState(1);
    pub const RUNNING: BasicState = BasicState(1 << 1);
    pub const HEADLESS: BasicState = BasicState(1 << 2);

    pub const fn empty() -> Self {
        BasicState(0)
    }

    pub const fn contains(self, other: BasicState) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_existing(self) -> bool {
        self.contains(Self::EXISTING)
    }

    pub fn is_running(self) -> bool {
        self.contains(Self::RUNNING)
    }

    pub fn is_headless(self) -> bool {
        self.contains(Self::HEADLESS)
    }
}

impl BitOr for BasicState {
    type Output = BasicState;

    fn bitor(self, rhs: Self) -> Self {
        BasicState(self.0 | rhs.0)
    }
}

/// Optional, more expensive parts of [`VirtualMachine::fetch_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchFlags(u8);

impl FetchFlags {
    pub const NONE: FetchFlags = FetchFlags(0);
    /// Disk size and location.
    pub const STORAGE: FetchFlags = FetchFlags(1);
    pub const SNAPSHOTS: FetchFlags = FetchFlags(1 << 1);

    pub const fn contains(self, other: FetchFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FetchFlags {
    type Output = FetchFlags;

    fn bitor(self, rhs: Self) -> Self {
        FetchFlags(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Port forwarding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

impl FromStr for Protocol {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(VmError::Invalid(format!("unknown protocol \"{other}\""))),
        }
    }
}

/// A host-to-guest port forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardingRule {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub host_port: u16,
    pub guest_port: u16,
}

/// Single ports with a well-known rule name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedPort {
    Ssh,
    Www,
    DBus,
}

impl ReservedPort {
    pub const ALL: [ReservedPort; 3] = [ReservedPort::Ssh, ReservedPort::Www, ReservedPort::DBus];

    pub fn rule_name(self) -> &'static str {
        match self {
            ReservedPort::Ssh => "ssh",
            ReservedPort::Www => "www",
            ReservedPort::DBus => "dbus",
        }
    }

    pub fn guest_port(self) -> u16 {
        match self {
            ReservedPort::Ssh => 22,
            ReservedPort::Www => 9292,
            ReservedPort::DBus => 7777,
        }
    }

    pub fn rule(self, host_port: u16) -> PortForwardingRule {
        PortForwardingRule {
            name: self.rule_name().to_string(),
            protocol: Protocol::Tcp,
            host_port,
            guest_port: self.guest_port(),
        }
    }
}

/// Port lists with numbered rule names (`<prefix><n>`, n from 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedPortList {
    QmlLive,
    Free,
}

impl ReservedPortList {
    pub fn prefix(self) -> &'static str {
        match self {
            ReservedPortList::QmlLive => "qmllive_",
            ReservedPortList::Free => "freeport_",
        }
    }

    /// Rules for `ports`, forwarded to the same port number in the guest.
    pub fn rules(self, ports: &[u16]) -> Result<Vec<PortForwardingRule>, VmError> {
        if ports.len() > MAX_RESERVED_PORT_LIST {
            return Err(VmError::TooManyPorts {
                list: self,
                count: ports.len(),
            });
        }
        Ok(ports
            .iter()
            .enumerate()
            .map(|(i, &port)| PortForwardingRule {
                name: format!("{}{}", self.prefix(), i + 1),
                protocol: Protocol::Tcp,
                host_port: port,
                guest_port: port,
            })
            .collect())
    }

    /// Whether `rule_name` belongs to this list.
    pub fn owns(self, rule_name: &str) -> bool {
        rule_name
            .strip_prefix(self.prefix())
            .is_some_and(|n| n.parse::<usize>().is_ok())
    }
}

impl fmt::Display for ReservedPortList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReservedPortList::QmlLive => "QmlLive",
            ReservedPortList::Free => "free",
        })
    }
}

// ---------------------------------------------------------------------------
// Info
// ---------------------------------------------------------------------------

/// Guest display resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

impl FromStr for VideoMode {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VmError::Invalid(format!("video mode \"{s}\" is not WIDTHxHEIGHT[xDEPTH]"));
        let parts: Vec<u32> = s
            .trim()
            .split('x')
            .map(|p| p.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        match parts.as_slice() {
            [width, height] => Ok(VideoMode {
                width: *width,
                height: *height,
                depth: 32,
            }),
            [width, height, depth] => Ok(VideoMode {
                width: *width,
                height: *height,
                depth: *depth,
            }),
            _ => Err(invalid()),
        }
    }
}

/// Cached configuration of a VM. Replaced wholesale after each fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineInfo {
    pub ssh_port: Option<u16>,
    pub www_port: Option<u16>,
    pub dbus_port: Option<u16>,
    pub qml_live_ports: Vec<u16>,
    pub free_ports: Vec<u16>,
    /// All rules, reserved ones included.
    pub port_forwarding_rules: Vec<PortForwardingRule>,
    /// Mapping name to host path.
    pub shared_paths: BTreeMap<String, PathBuf>,
    pub memory_size_mb: u32,
    pub cpu_count: u32,
    pub storage_size_mb: u64,
    pub video_mode: Option<VideoMode>,
    pub snapshots: Vec<String>,
}

impl VirtualMachineInfo {
    /// Fill the reserved-port fields from `port_forwarding_rules`.
    pub fn index_reserved_ports(&mut self) {
        let mut qml_live = Vec::new();
        let mut free = Vec::new();
        for rule in &self.port_forwarding_rules {
            match rule.name.as_str() {
                "ssh" => self.ssh_port = Some(rule.host_port),
                "www" => self.www_port = Some(rule.host_port),
                "dbus" => self.dbus_port = Some(rule.host_port),
                name => {
                    for (list, out) in [
                        (ReservedPortList::QmlLive, &mut qml_live),
                        (ReservedPortList::Free, &mut free),
                    ] {
                        if let Some(n) = name
                            .strip_prefix(list.prefix())
                            .and_then(|n| n.parse::<usize>().ok())
                        {
                            out.push((n, rule.host_port));
                        }
                    }
                }
            }
        }
        qml_live.sort_unstable();
        free.sort_unstable();
        self.qml_live_ports = qml_live.into_iter().map(|(_, p)| p).collect();
        self.free_ports = free.into_iter().map(|(_, p)| p).collect();
    }
}

// ---------------------------------------------------------------------------
// Shared backend state
// ---------------------------------------------------------------------------

/// State common to every backend: identity, the queue, the info cache and
/// the lock-down flag maintained by the owning connection.
#[derive(Debug)]
pub struct VmCore {
    name: String,
    queue: Arc<CommandQueue>,
    info: RwLock<VirtualMachineInfo>,
    locked_down: AtomicBool,
}

impl VmCore {
    pub fn new(name: impl Into<String>, queue: Arc<CommandQueue>) -> Self {
        Self {
            name: name.into(),
            queue,
            info: RwLock::new(VirtualMachineInfo::default()),
            locked_down: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn cached_info(&self) -> VirtualMachineInfo {
        self.info.read().clone()
    }

    pub fn replace_info(&self, info: VirtualMachineInfo) {
        *self.info.write() = info;
    }

    pub fn is_locked_down(&self) -> bool {
        self.locked_down.load(Ordering::SeqCst)
    }

    pub fn set_locked_down(&self, locked_down: bool) {
        self.locked_down.store(locked_down, Ordering::SeqCst);
    }

    /// Reject configuration changes outside of lock-down.
    pub fn ensure_mutable(&self, operation: &'static str) -> Result<(), VmError> {
        if self.is_locked_down() {
            return Ok(());
        }
        error!(vm = %self.name, operation, "configuration change attempted without lock-down");
        Err(VmError::NotLockedDown {
            vm: self.name.clone(),
            operation,
        })
    }

    /// Queue one runner and wait for it.
    pub async fn run<R: CommandRunner + 'static>(&self, runner: R) -> Result<CommandOutput, VmError> {
        Ok(self.queue.enqueue(runner).wait().await?)
    }

    /// Queue runners as one batch and wait for all of them. The first
    /// failure cancels the steps behind it and is returned.
    pub async fn run_batch(&self, runners: Vec<Box<dyn CommandRunner>>) -> Result<Vec<CommandOutput>, VmError> {
        let (_, handles) = self.queue.enqueue_batch(runners);
        let mut outputs = Vec::with_capacity(handles.len());
        for handle in handles {
            outputs.push(handle.wait().await?);
        }
        Ok(outputs)
    }
}

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    VirtualBox,
    Docker,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::VirtualBox => "VirtualBox",
            BackendKind::Docker => "Docker",
        })
    }
}

/// Uniform lifecycle and configuration interface over VM tools.
#[async_trait]
pub trait VirtualMachine: Send + Sync + fmt::Debug {
    fn core(&self) -> &VmCore;

    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Existence and run state. Never fails for a missing VM; it simply
    /// reports no flags.
    async fn probe(&self) -> Result<BasicState, VmError>;

    /// Refresh and return the cached [`VirtualMachineInfo`].
    async fn fetch_info(&self, flags: FetchFlags) -> Result<VirtualMachineInfo, VmError>;

    async fn start(&self) -> Result<(), VmError>;

    /// Hard power-off.
    async fn stop(&self) -> Result<(), VmError>;

    async fn prepare_to_start(&self) -> Result<(), VmError> {
        Ok(())
    }

    async fn commit_after_stop(&self) -> Result<(), VmError> {
        Ok(())
    }

    /// Runs once per boot after the first SSH connection.
    async fn initialize_guest(&self, _ssh: &SshParameters) -> Result<(), VmError> {
        Ok(())
    }

    // -- configuration (requires lock-down) ---------------------------------

    async fn set_shared_path(&self, which: SharedPath, host_path: &Path) -> Result<(), VmError>;

    async fn set_reserved_port_forwarding(&self, which: ReservedPort, host_port: u16) -> Result<(), VmError>;

    async fn set_reserved_port_list_forwarding(&self, which: ReservedPortList, ports: &[u16]) -> Result<(), VmError>;

    async fn add_port_forwarding(&self, rule: &PortForwardingRule) -> Result<(), VmError>;

    async fn remove_port_forwarding(&self, rule_name: &str) -> Result<(), VmError>;

    async fn set_video_mode(&self, mode: VideoMode) -> Result<(), VmError>;

    async fn set_memory_size_mb(&self, memory_mb: u32) -> Result<(), VmError>;

    async fn set_cpu_count(&self, cpu_count: u32) -> Result<(), VmError>;

    async fn set_storage_size_mb(&self, storage_mb: u64) -> Result<(), VmError>;

    async fn take_snapshot(&self, name: &str) -> Result<(), VmError>;

    async fn restore_snapshot(&self, name: &str) -> Result<(), VmError>;

    async fn remove_snapshot(&self, name: &str) -> Result<(), VmError>;
}

/// Build the backend selected in `settings`.
pub fn create(settings: &VmSettings, queue: Arc<CommandQueue>, state_dir: &Path) -> Arc<dyn VirtualMachine> {
    match settings.backend {
        BackendKind::VirtualBox => Arc::new(VirtualBox::new(&settings.name, queue, settings.headless)),
        BackendKind::Docker => Arc::new(Docker::new(
            &settings.name,
            settings.image.as_deref().unwrap_or(&settings.name),
            queue,
            state_dir,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_state_flags_combine() {
        let state = BasicState::EXISTING | BasicState::RUNNING;
        assert!(state.is_existing());
        assert!(state.is_running());
        assert!(!state.is_headless());
        assert!(!BasicState::empty().is_existing());
    }

    #[test]
    fn reserved_port_list_is_bounded() {
        let ports: Vec<u16> = (10000..10000 + MAX_RESERVED_PORT_LIST as u16 + 1).collect();
        let err = ReservedPortList::QmlLive.rules(&ports).unwrap_err();
        assert!(matches!(err, VmError::TooManyPorts { count: 11, .. }));
    }

    #[test]
    fn reserved_port_list_rules_are_numbered_from_one() {
        let rules = ReservedPortList::Free.rules(&[5000, 5001]).unwrap();
        assert_eq!(rules[0].name, "freeport_1");
        assert_eq!(rules[1].name, "freeport_2");
        assert_eq!(rules[1].guest_port, 5001);
        assert!(ReservedPortList::Free.owns("freeport_2"));
        assert!(!ReservedPortList::Free.owns("qmllive_2"));
        assert!(!ReservedPortList::Free.owns("freeport_x"));
    }

    #[test]
    fn reserved_ports_are_indexed_from_rules() {
        let mut info = VirtualMachineInfo {
            port_forwarding_rules: vec![
                ReservedPort::Ssh.rule(2222),
                ReservedPort::Www.rule(8080),
                PortForwardingRule {
                    name: "qmllive_2".into(),
                    protocol: Protocol::Tcp,
                    host_port: 10235,
                    guest_port: 10235,
                },
                PortForwardingRule {
                    name: "qmllive_1".into(),
                    protocol: Protocol::Tcp,
                    host_port: 10234,
                    guest_port: 10234,
                },
            ],
            ..VirtualMachineInfo::default()
        };
        info.index_reserved_ports();
        assert_eq!(info.ssh_port, Some(2222));
        assert_eq!(info.www_port, Some(8080));
        assert_eq!(info.dbus_port, None);
        assert_eq!(info.qml_live_ports, vec![10234, 10235]);
    }

    #[test]
    fn video_mode_parses_with_optional_depth() {
        assert_eq!(
            "1920x1080".parse::<VideoMode>().unwrap(),
            VideoMode { width: 1920, height: 1080, depth: 32 }
        );
        assert_eq!("800x600x16".parse::<VideoMode>().unwrap().to_string(), "800x600x16");
        assert!("800".parse::<VideoMode>().is_err());
    }

    #[tokio::test]
    async fn configuration_changes_require_lock_down() {
        let core = VmCore::new("vm", CommandQueue::new());
        assert!(matches!(
            core.ensure_mutable("set memory size"),
            Err(VmError::NotLockedDown { .. })
        ));
        core.set_locked_down(true);
        assert!(core.ensure_mutable("set memory size").is_ok());
    }
}
