//! Docker backend.
//!
//! The "VM" is an image; running it means a detached container named after
//! the VM. Docker has no persistent VM configuration, so ports, shares and
//! resource limits live in a small TOML state file and are applied on every
//! `docker run`. Stopping commits the container back into the image, and
//! snapshots are extra tags of that image.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::shared_path::{self, SharedPath};
use super::{
    BackendKind, BasicState, FetchFlags, PortForwardingRule, ReservedPort, ReservedPortList, VideoMode,
    VirtualMachine, VirtualMachineInfo, VmCore, VmError,
};
use crate::command::{CommandError, CommandQueue, ProcessRunner};

pub const DOCKER_ENV: &str = "VMLINK_DOCKER";

const LATEST_TAG: &str = "latest";

pub fn docker_program() -> String {
    std::env::var(DOCKER_ENV).unwrap_or_else(|_| "docker".to_string())
}

// ---------------------------------------------------------------------------
// Persistent state
// ---------------------------------------------------------------------------

/// Settings applied to each `docker run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerVmState {
    pub port_forwarding_rules: Vec<PortForwardingRule>,
    pub shared_paths: BTreeMap<String, PathBuf>,
    pub memory_size_mb: u32,
    pub cpu_count: u32,
    pub video_mode: Option<VideoMode>,
}

impl DockerVmState {
    pub async fn load(path: &Path) -> Result<Self, VmError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => toml::from_str(&content).map_err(|e| VmError::State {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(VmError::State {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), VmError> {
        let state_error = |message: String| VmError::State {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| state_error(e.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| state_error(e.to_string()))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| state_error(e.to_string()))
    }
}

/// Tags of `image` that count as snapshots.
pub fn parse_snapshot_tags(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|tag| !tag.is_empty() && *tag != LATEST_TAG && *tag != "<none>")
        .map(str::to_string)
        .collect()
}

fn is_name_conflict(stderr: &str) -> bool {
    stderr.contains("is already in use")
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Docker {
    core: VmCore,
    docker: String,
    image: String,
    state_file: PathBuf,
}

impl Docker {
    pub fn new(name: &str, image: &str, queue: Arc<CommandQueue>, state_dir: &Path) -> Self {
        Self {
            core: VmCore::new(name, queue),
            docker: docker_program(),
            image: image.to_string(),
            state_file: state_dir.join("docker").join(format!("{name}.toml")),
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    fn docker(&self) -> ProcessRunner {
        ProcessRunner::new(&self.docker)
    }

    fn image_ref(&self, tag: &str) -> String {
        format!("{}:{tag}", self.image)
    }

    /// `docker run` with everything recorded in the state file.
    pub fn run_args(&self, state: &DockerVmState) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            self.name().to_string(),
            "--hostname".to_string(),
            self.name().to_string(),
        ];
        if state.memory_size_mb > 0 {
            args.extend(["--memory".to_string(), format!("{}m", state.memory_size_mb)]);
        }
        if state.cpu_count > 0 {
            args.extend(["--cpus".to_string(), state.cpu_count.to_string()]);
        }
        for rule in &state.port_forwarding_rules {
            args.extend([
                "--publish".to_string(),
                format!("127.0.0.1:{}:{}/{}", rule.host_port, rule.guest_port, rule.protocol),
            ]);
        }
        args.extend(shared_path::docker_volume_args(&state.shared_paths));
        args.push(self.image_ref(LATEST_TAG));
        args
    }

    async fn load_state(&self) -> Result<DockerVmState, VmError> {
        DockerVmState::load(&self.state_file).await
    }

    /// Apply `change` to the state file and refresh the info cache.
    async fn update_state<F>(&self, operation: &'static str, change: F) -> Result<(), VmError>
    where
        F: FnOnce(&mut DockerVmState) -> Result<(), VmError> + Send,
    {
        self.core.ensure_mutable(operation)?;
        let mut state = self.load_state().await?;
        change(&mut state)?;
        state.save(&self.state_file).await?;
        debug!(vm = %self.name(), operation, path = %self.state_file.display(), "docker state updated");
        self.fetch_info(FetchFlags::NONE).await.map(|_| ())
    }

    async fn container_exists(&self) -> Result<bool, VmError> {
        let output = self
            .core
            .run(
                self.docker()
                    .args(["container", "inspect", "--format", "{{.Id}}", self.name()])
                    .expected_exit_codes([0, 1]),
            )
            .await?;
        Ok(output.exit_code == Some(0))
    }
}

#[async_trait]
impl VirtualMachine for Docker {
    fn core(&self) -> &VmCore {
        &self.core
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn probe(&self) -> Result<BasicState, VmError> {
        let outputs = self
            .core
            .run_batch(vec![
                Box::new(
                    self.docker()
                        .args(["image", "inspect", "--format", "{{.Id}}"])
                        .arg(self.image_ref(LATEST_TAG))
                        .expected_exit_codes([0, 1]),
                ),
                Box::new(
                    self.docker()
                        .args(["container", "inspect", "--format", "{{.State.Running}}", self.name()])
                        .expected_exit_codes([0, 1]),
                ),
            ])
            .await?;

        let image_exists = outputs.first().is_some_and(|o| o.exit_code == Some(0));
        let container = outputs.get(1);
        let container_exists = container.is_some_and(|o| o.exit_code == Some(0));
        let running = container.is_some_and(|o| o.exit_code == Some(0) && o.stdout.trim() == "true");

        // Containers never have a display.
        let mut state = BasicState::HEADLESS;
        if image_exists || container_exists {
            state = state | BasicState::EXISTING;
        }
        if running {
            state = state | BasicState::RUNNING;
        }
        Ok(state)
    }

    async fn fetch_info(&self, flags: FetchFlags) -> Result<VirtualMachineInfo, VmError> {
        let state = self.load_state().await?;
        let mut info = VirtualMachineInfo {
            port_forwarding_rules: state.port_forwarding_rules,
            shared_paths: state.shared_paths,
            memory_size_mb: state.memory_size_mb,
            cpu_count: state.cpu_count,
            video_mode: state.video_mode,
            ..VirtualMachineInfo::default()
        };
        info.index_reserved_ports();

        if flags.contains(FetchFlags::STORAGE) {
            let output = self
                .core
                .run(
                    self.docker()
                        .args(["image", "inspect", "--format", "{{.Size}}"])
                        .arg(self.image_ref(LATEST_TAG)),
                )
                .await?;
            let bytes: u64 = output.stdout.trim().parse().map_err(|_| VmError::Parse {
                tool: "docker",
                message: format!("image size \"{}\" is not a number", output.stdout.trim()),
            })?;
            info.storage_size_mb = bytes / (1024 * 1024);
        }

        if flags.contains(FetchFlags::SNAPSHOTS) {
            let output = self
                .core
                .run(
                    self.docker()
                        .args(["image", "ls", "--format", "{{.Tag}}"])
                        .arg(&self.image),
                )
                .await?;
            info.snapshots = parse_snapshot_tags(&output.stdout);
        }

        self.core.replace_info(info.clone());
        Ok(info)
    }

    async fn prepare_to_start(&self) -> Result<(), VmError> {
        let output = self
            .core
            .run(
                self.docker()
                    .args(["image", "inspect", "--format", "{{.Id}}"])
                    .arg(self.image_ref(LATEST_TAG))
                    .expected_exit_codes([0, 1]),
            )
            .await?;
        if output.exit_code != Some(0) {
            return Err(VmError::NotFound(self.image_ref(LATEST_TAG)));
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), VmError> {
        let state = self.load_state().await?;
        let run = || self.docker().args(self.run_args(&state));
        info!(vm = %self.name(), image = %self.image, "starting docker container");

        match self.core.run(run()).await {
            Ok(_) => Ok(()),
            Err(VmError::Command(CommandError::UnexpectedExit { stderr, .. })) if is_name_conflict(&stderr) => {
                warn!(vm = %self.name(), "removing stale container before retrying");
                // Both go to the front as one batch, so nothing queued
                // meanwhile lands between the removal and the retry, and a
                // failed removal cancels the retry.
                let (_, handles) = self.core.queue().enqueue_immediate_batch(vec![
                    Box::new(self.docker().args(["rm", "--force", self.name()])),
                    Box::new(run()),
                ]);
                for handle in handles {
                    handle.wait().await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stop(&self) -> Result<(), VmError> {
        info!(vm = %self.name(), "stopping docker container");
        self.core
            .run(self.docker().args(["stop", "--time", "10", self.name()]))
            .await?;
        Ok(())
    }

    async fn commit_after_stop(&self) -> Result<(), VmError> {
        if !self.container_exists().await? {
            debug!(vm = %self.name(), "no container to commit");
            return Ok(());
        }
        info!(vm = %self.name(), image = %self.image, "committing container");
        self.core
            .run_batch(vec![
                Box::new(
                    self.docker()
                        .args(["commit", self.name()])
                        .arg(self.image_ref(LATEST_TAG)),
                ),
                Box::new(self.docker().args(["rm", self.name()])),
            ])
            .await?;
        Ok(())
    }

    async fn set_shared_path(&self, which: SharedPath, host_path: &Path) -> Result<(), VmError> {
        let host_path = shared_path::validate_host_path(host_path)?;
        self.update_state("set shared path", move |state| {
            state.shared_paths.insert(which.mapping_name().to_string(), host_path);
            Ok(())
        })
        .await
    }

    async fn set_reserved_port_forwarding(&self, which: ReservedPort, host_port: u16) -> Result<(), VmError> {
        let rule = which.rule(host_port);
        self.update_state("set port forwarding", move |state| {
            state.port_forwarding_rules.retain(|r| r.name != rule.name);
            state.port_forwarding_rules.push(rule);
            Ok(())
        })
        .await
    }

    async fn set_reserved_port_list_forwarding(&self, which: ReservedPortList, ports: &[u16]) -> Result<(), VmError> {
        let rules = which.rules(ports)?;
        self.update_state("set port forwarding", move |state| {
            state.port_forwarding_rules.retain(|r| !which.owns(&r.name));
            state.port_forwarding_rules.extend(rules);
            Ok(())
        })
        .await
    }

    async fn add_port_forwarding(&self, rule: &PortForwardingRule) -> Result<(), VmError> {
        let rule = rule.clone();
        self.update_state("add port forwarding", move |state| {
            if state.port_forwarding_rules.iter().any(|r| r.name == rule.name) {
                return Err(VmError::Invalid(format!("rule \"{}\" already exists", rule.name)));
            }
            state.port_forwarding_rules.push(rule);
            Ok(())
        })
        .await
    }

    async fn remove_port_forwarding(&self, rule_name: &str) -> Result<(), VmError> {
        let rule_name = rule_name.to_string();
        self.update_state("remove port forwarding", move |state| {
            let before = state.port_forwarding_rules.len();
            state.port_forwarding_rules.retain(|r| r.name != rule_name);
            if state.port_forwarding_rules.len() == before {
                return Err(VmError::NoSuchRule(rule_name));
            }
            Ok(())
        })
        .await
    }

    async fn set_video_mode(&self, mode: VideoMode) -> Result<(), VmError> {
        self.update_state("set video mode", move |state| {
            state.video_mode = Some(mode);
            Ok(())
        })
        .await
    }

    async fn set_memory_size_mb(&self, memory_mb: u32) -> Result<(), VmError> {
        self.update_state("set memory size", move |state| {
            state.memory_size_mb = memory_mb;
            Ok(())
        })
        .await
    }

    async fn set_cpu_count(&self, cpu_count: u32) -> Result<(), VmError> {
        self.update_state("set CPU count", move |state| {
            state.cpu_count = cpu_count;
            Ok(())
        })
        .await
    }

    async fn set_storage_size_mb(&self, _storage_mb: u64) -> Result<(), VmError> {
        self.core.ensure_mutable("set storage size")?;
        Err(VmError::Unsupported {
            backend: BackendKind::Docker,
            operation: "resizing storage",
        })
    }

    async fn take_snapshot(&self, name: &str) -> Result<(), VmError> {
        self.core.ensure_mutable("take snapshot")?;
        self.core
            .run(
                self.docker()
                    .arg("tag")
                    .arg(self.image_ref(LATEST_TAG))
                    .arg(self.image_ref(name)),
            )
            .await?;
        self.fetch_info(FetchFlags::SNAPSHOTS).await.map(|_| ())
    }

    async fn restore_snapshot(&self, name: &str) -> Result<(), VmError> {
        self.core.ensure_mutable("restore snapshot")?;
        self.core
            .run(
                self.docker()
                    .arg("tag")
                    .arg(self.image_ref(name))
                    .arg(self.image_ref(LATEST_TAG)),
            )
            .await?;
        self.fetch_info(FetchFlags::SNAPSHOTS).await.map(|_| ())
    }

    async fn remove_snapshot(&self, name: &str) -> Result<(), VmError> {
        self.core.ensure_mutable("remove snapshot")?;
        if name == LATEST_TAG {
            return Err(VmError::Invalid("the current image cannot be removed as a snapshot".to_string()));
        }
        self.core
            .run(self.docker().arg("rmi").arg(self.image_ref(name)))
            .await?;
        self.fetch_info(FetchFlags::SNAPSHOTS).await.map(|_| ())
    }
}
