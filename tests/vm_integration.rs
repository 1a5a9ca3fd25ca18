//! Integration tests against real VM tooling.
//!
//! These drive the VirtualBox and docker backends, and the connection engine
//! on top of them, through the actual `VBoxManage`, `docker` and `ssh`
//! binaries. They need prepared machines and are gated with the
//! `vm-integration-tests` feature flag.
//!
//! # Running
//!
//! ```bash
//! VMLINK_TEST_VBOX_VM=build-vm \
//! VMLINK_TEST_DOCKER_IMAGE=vmlink/test-guest \
//!     cargo test --features vm-integration-tests --test vm_integration -- --test-threads=1
//! ```
//!
//! Tests whose machine is not configured are skipped with a note on stderr.
//! The VirtualBox VM must be powered off, forward a host port to the guest's
//! sshd (`VMLINK_TEST_SSH_PORT`, default 2222) and accept the key in
//! `VMLINK_TEST_SSH_KEY` for `VMLINK_TEST_SSH_USER` (default `builder`).

#![cfg(feature = "vm-integration-tests")]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use vmlink::command::CommandQueue;
use vmlink::connection::{ConnectOptions, ConnectionOptions, State, VmConnection};
use vmlink::ssh::SshParameters;
use vmlink::ssh::openssh::OpenSshConnector;
use vmlink::ui::{AnswerPolicy, HeadlessUi};
use vmlink::vm::docker::Docker;
use vmlink::vm::virtualbox::VirtualBox;
use vmlink::vm::{FetchFlags, VirtualMachine, VmError};

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn vbox_vm_name() -> Option<String> {
    let name = env("VMLINK_TEST_VBOX_VM");
    if name.is_none() {
        eprintln!("VMLINK_TEST_VBOX_VM not set, skipping");
    }
    name
}

fn docker_image() -> Option<String> {
    let image = env("VMLINK_TEST_DOCKER_IMAGE");
    if image.is_none() {
        eprintln!("VMLINK_TEST_DOCKER_IMAGE not set, skipping");
    }
    image
}

fn ssh_parameters() -> SshParameters {
    SshParameters {
        port: env("VMLINK_TEST_SSH_PORT").and_then(|p| p.parse().ok()).unwrap_or(2222),
        user: env("VMLINK_TEST_SSH_USER").unwrap_or_else(|| "builder".to_string()),
        private_key: env("VMLINK_TEST_SSH_KEY").map(PathBuf::from),
        connection_timeout_secs: 120,
        ..SshParameters::default()
    }
}

/// Poll `probe` until the VM reaches the wanted run state.
async fn wait_running(vm: &dyn VirtualMachine, running: bool, deadline: Duration) -> bool {
    let poll = async {
        loop {
            if let Ok(state) = vm.probe().await {
                if state.is_running() == running {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };
    timeout(deadline, poll).await.is_ok()
}

// ---------------------------------------------------------------------------
// VirtualBox
// ---------------------------------------------------------------------------

#[tokio::test]
async fn virtualbox_reports_a_missing_vm_without_error() {
    let vm = VirtualBox::new("vmlink-test-does-not-exist", CommandQueue::new(), true);
    let state = vm.probe().await.expect("probe of a missing VM succeeds");
    assert!(!state.is_existing());
}

#[tokio::test]
async fn virtualbox_reads_machine_settings() {
    let Some(name) = vbox_vm_name() else { return };
    let vm = VirtualBox::new(&name, CommandQueue::new(), true);

    let state = vm.probe().await.expect("probe");
    assert!(state.is_existing(), "{name} must exist");

    let info = vm.fetch_info(FetchFlags::STORAGE | FetchFlags::SNAPSHOTS).await.expect("fetch info");
    assert!(info.memory_size_mb > 0);
    assert!(info.cpu_count > 0);
    assert!(info.storage_size_mb > 0);
    assert_eq!(vm.core().cached_info(), info);
}

#[tokio::test]
async fn virtualbox_refuses_changes_without_lock_down() {
    let Some(name) = vbox_vm_name() else { return };
    let vm = VirtualBox::new(&name, CommandQueue::new(), true);

    let err = vm.set_memory_size_mb(2048).await.unwrap_err();
    assert!(matches!(err, VmError::NotLockedDown { .. }));
}

#[tokio::test]
async fn virtualbox_connect_and_disconnect() {
    let Some(name) = vbox_vm_name() else { return };
    let queue = CommandQueue::new();
    let vm: Arc<dyn VirtualMachine> = Arc::new(VirtualBox::new(&name, Arc::clone(&queue), true));
    let ui = HeadlessUi::new(AnswerPolicy::yes());
    let connection = VmConnection::new(
        Arc::clone(&vm),
        Arc::new(ui),
        Arc::new(OpenSshConnector::new()),
        ssh_parameters(),
        ConnectionOptions::default(),
    );

    let connected = timeout(
        Duration::from_secs(300),
        connection.connect_to(ConnectOptions { ask_start_vm: false }),
    )
    .await
    .expect("connect within five minutes");
    connected.expect("connect succeeds");
    assert_eq!(connection.state(), State::Connected);
    assert!(!connection.is_virtual_machine_off());

    timeout(Duration::from_secs(120), connection.disconnect_from())
        .await
        .expect("disconnect within two minutes")
        .expect("disconnect succeeds");
    assert_eq!(connection.state(), State::Disconnected);
    assert!(wait_running(vm.as_ref(), false, Duration::from_secs(30)).await);

    queue.wait().await;
}

// ---------------------------------------------------------------------------
// Docker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn docker_container_starts_and_stops() {
    let Some(image) = docker_image() else { return };
    let state_dir = tempfile::tempdir().expect("tempdir");
    let name = format!("vmlink-test-{}", std::process::id());
    let vm = Docker::new(&name, &image, CommandQueue::new(), state_dir.path());

    let state = vm.probe().await.expect("probe");
    assert!(!state.is_running());

    vm.prepare_to_start().await.expect("prepare");
    vm.start().await.expect("start");
    assert!(wait_running(&vm, true, Duration::from_secs(30)).await, "container must come up");

    vm.stop().await.expect("stop");
    assert!(wait_running(&vm, false, Duration::from_secs(30)).await, "container must go down");
    vm.commit_after_stop().await.expect("commit");
}

#[tokio::test]
async fn docker_settings_persist_in_the_state_file() {
    let Some(image) = docker_image() else { return };
    let state_dir = tempfile::tempdir().expect("tempdir");
    let name = format!("vmlink-settings-{}", std::process::id());
    let vm = Docker::new(&name, &image, CommandQueue::new(), state_dir.path());

    assert!(matches!(
        vm.set_cpu_count(2).await,
        Err(VmError::NotLockedDown { .. })
    ));

    vm.core().set_locked_down(true);
    vm.set_cpu_count(2).await.expect("set cpus");
    vm.set_memory_size_mb(1024).await.expect("set memory");
    vm.core().set_locked_down(false);

    assert!(vm.state_file().exists());
    let info = vm.fetch_info(FetchFlags::NONE).await.expect("fetch info");
    assert_eq!(info.cpu_count, 2);
    assert_eq!(info.memory_size_mb, 1024);
}
