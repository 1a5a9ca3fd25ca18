//! VirtualBox backend driven through `VBoxManage`.
//!
//! All state is read from `showvminfo --machinereadable`, which prints one
//! `key=value` pair per line (keys and string values may be quoted):
//!
//! ```text
//! VMState="running"
//! SessionName="headless"
//! memory=4096
//! Forwarding(0)="ssh,tcp,127.0.0.1,2222,,22"
//! SharedFolderNameMachineMapping1="vmlink_workspace"
//! SharedFolderPathMachineMapping1="/home/me/src"
//! "SATA-0-0"="/home/me/VirtualBox VMs/build/build.vdi"
//! SnapshotName="clean"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::shared_path::{self, SharedPath};
use super::{
    BackendKind, BasicState, FetchFlags, PortForwardingRule, ReservedPort, ReservedPortList,
    VideoMode, VirtualMachine, VirtualMachineInfo, VmCore, VmError,
};
use crate::command::{CommandError, CommandQueue, CommandRunner, ProcessRunner};

pub const VBOXMANAGE_ENV: &str = "VMLINK_VBOXMANAGE";

const VIDEO_MODE_KEY: &str = "CustomVideoMode1";

/// VMState values that mean a session holds the machine.
const RUNNING_STATES: &[&str] = &[
    "running",
    "paused",
    "stuck",
    "starting",
    "stopping",
    "saving",
    "restoring",
    "teleporting",
    "livesnapshotting",
    "onlinesnapshotting",
    "deletingsnapshotlive",
];

/// Resolve the `VBoxManage` binary: the environment override, then `PATH`,
/// then the usual install locations.
pub fn find_vboxmanage() -> String {
    if let Ok(path) = std::env::var(VBOXMANAGE_ENV) {
        return path;
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for name in ["VBoxManage", "vboxmanage", "VBoxManage.exe"] {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return candidate.display().to_string();
                }
            }
        }
    }

    let candidates: &[&str] = &[
        "/usr/bin/VBoxManage",
        "/usr/local/bin/VBoxManage",
        "/Applications/VirtualBox.app/Contents/MacOS/VBoxManage",
        r"C:\Program Files\Oracle\VirtualBox\VBoxManage.exe",
    ];
    for &path in candidates {
        if Path::new(path).is_file() {
            return path.to_string();
        }
    }

    // Let the spawn fail with a clear "not found".
    "VBoxManage".to_string()
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// `showvminfo --machinereadable` as key/value pairs, in output order.
pub fn parse_machine_readable(output: &str) -> Vec<(String, String)> {
    output.lines().filter_map(|line| split_entry(line.trim())).collect()
}

fn split_entry(line: &str) -> Option<(String, String)> {
    let (key, value) = match line.strip_prefix('"') {
        Some(rest) => {
            let end = rest.find('"')?;
            (&rest[..end], rest[end + 1..].strip_prefix('=')?)
        }
        None => line.split_once('=')?,
    };
    Some((key.to_string(), unquote(value).to_string()))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// `name,proto,host_ip,host_port,guest_ip,guest_port`
pub fn parse_forwarding_rule(value: &str) -> Option<PortForwardingRule> {
    let fields: Vec<&str> = value.split(',').collect();
    let [name, protocol, _host_ip, host_port, _guest_ip, guest_port] = fields.as_slice() else {
        return None;
    };
    Some(PortForwardingRule {
        name: name.to_string(),
        protocol: protocol.parse().ok()?,
        host_port: host_port.parse().ok()?,
        guest_port: guest_port.parse().ok()?,
    })
}

/// The parts of a `showvminfo` dump the backend cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineDump {
    pub vm_state: String,
    pub session_name: Option<String>,
    pub memory_mb: u32,
    pub cpus: u32,
    pub rules: Vec<PortForwardingRule>,
    pub shared_paths: Vec<(String, PathBuf)>,
    pub snapshots: Vec<String>,
    pub disk: Option<PathBuf>,
}

impl MachineDump {
    pub fn parse(output: &str) -> Self {
        let mut dump = MachineDump::default();
        let mut share_names: Vec<(String, String)> = Vec::new();
        let mut share_paths: Vec<(String, PathBuf)> = Vec::new();

        for (key, value) in parse_machine_readable(output) {
            match key.as_str() {
                "VMState" => dump.vm_state = value,
                "SessionName" | "SessionType" if !value.is_empty() => dump.session_name = Some(value),
                "memory" => dump.memory_mb = value.parse().unwrap_or_default(),
                "cpus" => dump.cpus = value.parse().unwrap_or_default(),
                k if k.starts_with("Forwarding(") => {
                    if let Some(rule) = parse_forwarding_rule(&value) {
                        dump.rules.push(rule);
                    }
                }
                k if k.starts_with("SharedFolderNameMachineMapping") => {
                    let index = k.trim_start_matches("SharedFolderNameMachineMapping").to_string();
                    share_names.push((index, value));
                }
                k if k.starts_with("SharedFolderPathMachineMapping") => {
                    let index = k.trim_start_matches("SharedFolderPathMachineMapping").to_string();
                    share_paths.push((index, PathBuf::from(value)));
                }
                k if k.starts_with("SnapshotName") => dump.snapshots.push(value),
                k if dump.disk.is_none() && is_disk_attachment(k, &value) => {
                    dump.disk = Some(PathBuf::from(value));
                }
                _ => {}
            }
        }

        for (index, name) in share_names {
            if let Some((_, path)) = share_paths.iter().find(|(i, _)| *i == index) {
                dump.shared_paths.push((name, path.clone()));
            }
        }
        dump
    }

    pub fn basic_state(&self) -> BasicState {
        let mut state = BasicState::EXISTING;
        if RUNNING_STATES.contains(&self.vm_state.as_str()) {
            state = state | BasicState::RUNNING;
        }
        if self.session_name.as_deref() == Some("headless") {
            state = state | BasicState::HEADLESS;
        }
        state
    }

    pub fn into_info(self) -> VirtualMachineInfo {
        let mut info = VirtualMachineInfo {
            port_forwarding_rules: self.rules,
            shared_paths: self.shared_paths.into_iter().collect(),
            memory_size_mb: self.memory_mb,
            cpu_count: self.cpus,
            snapshots: self.snapshots,
            ..VirtualMachineInfo::default()
        };
        info.index_reserved_ports();
        info
    }
}

/// Controller attachment keys look like `SATA-0-0` or `IDE Controller-1-0`.
fn is_disk_attachment(key: &str, value: &str) -> bool {
    let mut parts = key.rsplitn(3, '-');
    let (Some(device), Some(port), Some(_controller)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    device.parse::<u32>().is_ok()
        && port.parse::<u32>().is_ok()
        && [".vdi", ".vmdk", ".vhd"]
            .iter()
            .any(|ext| value.to_ascii_lowercase().ends_with(ext))
}

/// `getextradata` prints `Value: 1920x1080x32` or `No value set!`.
pub fn parse_extradata_video_mode(output: &str) -> Option<VideoMode> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Value:"))
        .and_then(|v| v.trim().parse().ok())
}

/// `showmediuminfo` prints `Capacity:       8192 MBytes`.
pub fn parse_medium_capacity_mb(output: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Capacity:"))
        .and_then(|v| v.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("VBOX_E_OBJECT_NOT_FOUND") || stderr.contains("Could not find a registered machine")
}

fn natpf_rule(rule: &PortForwardingRule) -> String {
    format!(
        "{},{},127.0.0.1,{},,{}",
        rule.name, rule.protocol, rule.host_port, rule.guest_port
    )
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct VirtualBox {
    core: VmCore,
    vboxmanage: String,
    headless: bool,
}

impl VirtualBox {
    pub fn new(name: &str, queue: Arc<CommandQueue>, headless: bool) -> Self {
        Self {
            core: VmCore::new(name, queue),
            vboxmanage: find_vboxmanage(),
            headless,
        }
    }

    fn vbox(&self) -> ProcessRunner {
        ProcessRunner::new(&self.vboxmanage)
    }

    fn show_vm_info(&self) -> ProcessRunner {
        self.vbox().args(["showvminfo", self.name(), "--machinereadable"])
    }

    fn natpf_delete(&self, rule_name: &str) -> ProcessRunner {
        // Deleting a rule that does not exist fails with 1.
        self.vbox()
            .args(["modifyvm", self.name(), "--natpf1", "delete", rule_name])
            .expected_exit_codes([0, 1])
    }

    fn natpf_add(&self, rule: &PortForwardingRule) -> ProcessRunner {
        self.vbox()
            .args(["modifyvm", self.name(), "--natpf1"])
            .arg(natpf_rule(rule))
    }

    async fn dump(&self) -> Result<MachineDump, VmError> {
        match self.core.run(self.show_vm_info()).await {
            Ok(output) => Ok(MachineDump::parse(&output.stdout)),
            Err(VmError::Command(CommandError::UnexpectedExit { stderr, .. })) if is_not_found(&stderr) => {
                Err(VmError::NotFound(self.name().to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh(&self) -> Result<(), VmError> {
        self.fetch_info(FetchFlags::NONE).await.map(|_| ())
    }
}

#[async_trait]
impl VirtualMachine for VirtualBox {
    fn core(&self) -> &VmCore {
        &self.core
    }

    fn kind(&self) -> BackendKind {
        BackendKind::VirtualBox
    }

    async fn probe(&self) -> Result<BasicState, VmError> {
        let output = self
            .core
            .run(self.show_vm_info().expected_exit_codes([0, 1]))
            .await?;
        if output.exit_code == Some(0) {
            return Ok(MachineDump::parse(&output.stdout).basic_state());
        }
        if is_not_found(&output.stderr) {
            return Ok(BasicState::empty());
        }
        Err(CommandError::UnexpectedExit {
            command: self.show_vm_info().to_string(),
            code: output.exit_code.unwrap_or(1),
            stdout: output.stdout,
            stderr: output.stderr.trim().to_string(),
        }
        .into())
    }

    async fn fetch_info(&self, flags: FetchFlags) -> Result<VirtualMachineInfo, VmError> {
        let runners: Vec<Box<dyn CommandRunner>> = vec![
            Box::new(self.show_vm_info()),
            Box::new(self.vbox().args(["getextradata", self.name(), VIDEO_MODE_KEY])),
        ];
        let outputs = match self.core.run_batch(runners).await {
            Err(VmError::Command(CommandError::UnexpectedExit { stderr, .. })) if is_not_found(&stderr) => {
                return Err(VmError::NotFound(self.name().to_string()));
            }
            other => other?,
        };
        let (show, extradata) = match outputs.as_slice() {
            [show, extradata] => (show, extradata),
            _ => {
                return Err(VmError::Parse {
                    tool: "VBoxManage",
                    message: "missing output of batched command".to_string(),
                });
            }
        };

        let dump = MachineDump::parse(&show.stdout);
        let disk = dump.disk.clone();
        let mut info = dump.into_info();
        info.video_mode = parse_extradata_video_mode(&extradata.stdout);

        if flags.contains(FetchFlags::STORAGE) {
            if let Some(disk) = disk {
                let output = self
                    .core
                    .run(self.vbox().args(["showmediuminfo", "disk"]).arg(disk.display().to_string()))
                    .await?;
                info.storage_size_mb = parse_medium_capacity_mb(&output.stdout).ok_or_else(|| VmError::Parse {
                    tool: "VBoxManage",
                    message: "showmediuminfo printed no capacity".to_string(),
                })?;
            }
        }
        if !flags.contains(FetchFlags::SNAPSHOTS) {
            info.snapshots.clear();
        }

        debug!(vm = %self.name(), ?info, "fetched VirtualBox info");
        self.core.replace_info(info.clone());
        Ok(info)
    }

    async fn start(&self) -> Result<(), VmError> {
        let kind = if self.headless { "headless" } else { "gui" };
        info!(vm = %self.name(), kind, "starting VirtualBox VM");
        self.core
            .run(self.vbox().args(["startvm", self.name(), "--type", kind]))
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), VmError> {
        info!(vm = %self.name(), "powering off VirtualBox VM");
        self.core
            .run(self.vbox().args(["controlvm", self.name(), "poweroff"]))
            .await?;
        Ok(())
    }

    async fn set_shared_path(&self, which: SharedPath, host_path: &Path) -> Result<(), VmError> {
        self.core.ensure_mutable("set shared path")?;
        let host_path = shared_path::validate_host_path(host_path)?;
        let name = which.mapping_name();
        self.core
            .run_batch(vec![
                Box::new(
                    self.vbox()
                        .args(["sharedfolder", "remove", self.name(), "--name", name])
                        .expected_exit_codes([0, 1]),
                ),
                Box::new(
                    self.vbox()
                        .args(["sharedfolder", "add", self.name(), "--name", name, "--hostpath"])
                        .arg(host_path.display().to_string())
                        .arg("--automount")
                        .arg(format!("--auto-mount-point={}", which.guest_mount_point())),
                ),
            ])
            .await?;
        self.refresh().await
    }

    async fn set_reserved_port_forwarding(&self, which: ReservedPort, host_port: u16) -> Result<(), VmError> {
        self.core.ensure_mutable("set port forwarding")?;
        let rule = which.rule(host_port);
        self.core
            .run_batch(vec![
                Box::new(self.natpf_delete(&rule.name)),
                Box::new(self.natpf_add(&rule)),
            ])
            .await?;
        self.refresh().await
    }

    async fn set_reserved_port_list_forwarding(&self, which: ReservedPortList, ports: &[u16]) -> Result<(), VmError> {
        self.core.ensure_mutable("set port forwarding")?;
        let rules = which.rules(ports)?;
        let current = self.fetch_info(FetchFlags::NONE).await?;

        let mut runners: Vec<Box<dyn CommandRunner>> = current
            .port_forwarding_rules
            .iter()
            .filter(|r| which.owns(&r.name))
            .map(|r| Box::new(self.natpf_delete(&r.name)) as Box<dyn CommandRunner>)
            .collect();
        runners.extend(rules.iter().map(|r| Box::new(self.natpf_add(r)) as Box<dyn CommandRunner>));
        if !runners.is_empty() {
            self.core.run_batch(runners).await?;
        }
        self.refresh().await
    }

    async fn add_port_forwarding(&self, rule: &PortForwardingRule) -> Result<(), VmError> {
        self.core.ensure_mutable("add port forwarding")?;
        self.core.run(self.natpf_add(rule)).await?;
        self.refresh().await
    }

    async fn remove_port_forwarding(&self, rule_name: &str) -> Result<(), VmError> {
        self.core.ensure_mutable("remove port forwarding")?;
        let current = self.fetch_info(FetchFlags::NONE).await?;
        if !current.port_forwarding_rules.iter().any(|r| r.name == rule_name) {
            return Err(VmError::NoSuchRule(rule_name.to_string()));
        }
        self.core
            .run(
                self.vbox()
                    .args(["modifyvm", self.name(), "--natpf1", "delete", rule_name]),
            )
            .await?;
        self.refresh().await
    }

    async fn set_video_mode(&self, mode: VideoMode) -> Result<(), VmError> {
        self.core.ensure_mutable("set video mode")?;
        self.core
            .run(
                self.vbox()
                    .args(["setextradata", self.name(), VIDEO_MODE_KEY])
                    .arg(mode.to_string()),
            )
            .await?;
        self.refresh().await
    }

    async fn set_memory_size_mb(&self, memory_mb: u32) -> Result<(), VmError> {
        self.core.ensure_mutable("set memory size")?;
        if memory_mb == 0 {
            return Err(VmError::Invalid("memory size must be positive".to_string()));
        }
        self.core
            .run(
                self.vbox()
                    .args(["modifyvm", self.name(), "--memory"])
                    .arg(memory_mb.to_string()),
            )
            .await?;
        self.refresh().await
    }

    async fn set_cpu_count(&self, cpu_count: u32) -> Result<(), VmError> {
        self.core.ensure_mutable("set CPU count")?;
        if cpu_count == 0 {
            return Err(VmError::Invalid("CPU count must be positive".to_string()));
        }
        self.core
            .run(
                self.vbox()
                    .args(["modifyvm", self.name(), "--cpus"])
                    .arg(cpu_count.to_string()),
            )
            .await?;
        self.refresh().await
    }

    async fn set_storage_size_mb(&self, storage_mb: u64) -> Result<(), VmError> {
        self.core.ensure_mutable("set storage size")?;
        let dump = self.dump().await?;
        let disk = dump.disk.ok_or_else(|| VmError::Invalid(format!("\"{}\" has no disk attached", self.name())))?;

        let current = self
            .core
            .run(self.vbox().args(["showmediuminfo", "disk"]).arg(disk.display().to_string()))
            .await?;
        if let Some(current_mb) = parse_medium_capacity_mb(&current.stdout) {
            if storage_mb < current_mb {
                return Err(VmError::Invalid(format!(
                    "cannot shrink disk from {current_mb} MB to {storage_mb} MB"
                )));
            }
        }

        self.core
            .run(
                self.vbox()
                    .args(["modifymedium", "disk"])
                    .arg(disk.display().to_string())
                    .arg("--resize")
                    .arg(storage_mb.to_string()),
            )
            .await?;
        self.fetch_info(FetchFlags::STORAGE).await.map(|_| ())
    }

    async fn take_snapshot(&self, name: &str) -> Result<(), VmError> {
        self.core.ensure_mutable("take snapshot")?;
        self.core
            .run(self.vbox().args(["snapshot", self.name(), "take", name]))
            .await?;
        self.fetch_info(FetchFlags::SNAPSHOTS).await.map(|_| ())
    }

    async fn restore_snapshot(&self, name: &str) -> Result<(), VmError> {
        self.core.ensure_mutable("restore snapshot")?;
        self.core
            .run(self.vbox().args(["snapshot", self.name(), "restore", name]))
            .await?;
        self.fetch_info(FetchFlags::SNAPSHOTS).await.map(|_| ())
    }

    async fn remove_snapshot(&self, name: &str) -> Result<(), VmError> {
        self.core.ensure_mutable("remove snapshot")?;
        self.core
            .run(self.vbox().args(["snapshot", self.name(), "delete", name]))
            .await?;
        self.fetch_info(FetchFlags::SNAPSHOTS).await.map(|_| ())
    }
}
