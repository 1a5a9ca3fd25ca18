//! End-to-end scenarios for the connection engine against a scripted VM,
//! SSH connector and UI. All run on a paused clock, so the 20 s VM timeouts
//! and 1 s retry delays cost nothing.
//!
//! Covered here:
//! - starting a stopped VM and connecting through refused SSH attempts
//! - disconnecting: SSH close, guest shutdown, commit, off
//! - lock-down of a VM that will not power off, ending in `Zombie`
//! - lock-down excluding competing requests, and reconnect on release
//! - polling a settled VM emitting nothing
//! - declined start, start failure, start timeout, busy rejection
//! - an occupied SSH port, an unreachable guest shutdown, a failing power off

mod support;

use std::time::Duration;

use vmlink::connection::{ConnectOptions, ConnectionError, ConnectionEvent, Operation, State, Timeouts};
use vmlink::state_machine::{SshState, VmState};
use vmlink::ui::{AnswerPolicy, Question, Warning};
use vmlink::vm::VirtualMachine;

use support::{Harness, MockVmState, drain, state_changes, test_options};

const ASK: ConnectOptions = ConnectOptions { ask_start_vm: true };
const NO_ASK: ConnectOptions = ConnectOptions { ask_start_vm: false };

fn stopped_vm() -> MockVmState {
    MockVmState::default()
}

fn running_vm() -> MockVmState {
    MockVmState {
        running: true,
        ..MockVmState::default()
    }
}

// ---------------------------------------------------------------------------
// Connecting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn starts_vm_and_connects_through_refused_attempts() {
    let h = Harness::new(stopped_vm(), 3, true, AnswerPolicy::yes());
    let mut events = h.connection.subscribe();

    h.connection.connect_to(ASK).await.unwrap();

    assert_eq!(h.connection.state(), State::Connected);
    assert_eq!(h.connector.attempts(), 4);
    let calls = h.vm.calls();
    assert_eq!(calls, vec!["prepare", "start", "init-guest"]);

    let events = drain(&mut events);
    assert_eq!(
        state_changes(&events),
        vec![State::Starting, State::Connecting, State::Connected]
    );
    assert!(events.contains(&ConnectionEvent::VirtualMachineOffChanged(false)));
    assert!(!h.connection.is_virtual_machine_off());
}

#[tokio::test(start_paused = true)]
async fn creates_missing_vm_and_retries_a_timed_out_attempt() {
    let h = Harness::new(
        MockVmState {
            exists: false,
            ..MockVmState::default()
        },
        0,
        true,
        AnswerPolicy::no(),
    );
    h.connector.time_out_next(1);
    let mut events = h.connection.subscribe();

    h.connection.connect_to(NO_ASK).await.unwrap();

    assert_eq!(h.connection.state(), State::Connected);
    assert_eq!(h.connector.attempts(), 2);
    assert_eq!(h.vm.calls(), vec!["prepare", "start", "init-guest"]);
    // The timeout fell inside the boot grace period: no error on the way.
    assert_eq!(
        state_changes(&drain(&mut events)),
        vec![State::Starting, State::Connecting, State::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn occupied_ssh_port_stops_the_start() {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let options = vmlink::connection::ConnectionOptions {
        ssh_port_check: true,
        ..test_options()
    };
    let h = Harness::with_options(stopped_vm(), 0, true, AnswerPolicy::yes(), options);
    h.connection.set_ssh_parameters(vmlink::ssh::SshParameters {
        port,
        ..Default::default()
    });

    let err = h.connection.connect_to(NO_ASK).await.unwrap_err();

    assert!(matches!(err, ConnectionError::Failed(ref m) if m.contains("already in use")), "{err:?}");
    let status = h.connection.status();
    assert_eq!(status.vm_state, VmState::StartingError);
    assert_eq!(status.state, State::Error);
    assert!(h.ui.active_warnings().contains(&Warning::SshPortOccupied));
    assert_eq!(h.vm.count("prepare"), 0);
    assert_eq!(h.vm.count("start"), 0);
    drop(listener);
}

#[tokio::test(start_paused = true)]
async fn connects_to_vm_started_elsewhere_without_starting_it() {
    let h = Harness::new(running_vm(), 0, true, AnswerPolicy::no());

    h.connection.connect_to(ASK).await.unwrap();

    assert_eq!(h.connection.state(), State::Connected);
    assert_eq!(h.vm.count("start"), 0);
    assert_eq!(h.vm.count("prepare"), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_succeeds_immediately() {
    let h = Harness::new(running_vm(), 0, true, AnswerPolicy::yes());
    h.connection.connect_to(NO_ASK).await.unwrap();
    let attempts = h.connector.attempts();

    h.connection.connect_to(NO_ASK).await.unwrap();
    assert_eq!(h.connector.attempts(), attempts);
}

#[tokio::test(start_paused = true)]
async fn declined_start_leaves_vm_off() {
    let h = Harness::new(stopped_vm(), 0, true, AnswerPolicy::no());

    let err = h.connection.connect_to(ASK).await.unwrap_err();

    assert_eq!(err, ConnectionError::Declined);
    assert_eq!(h.connection.state(), State::Disconnected);
    assert_eq!(h.vm.count("start"), 0);
    assert!(h.connection.is_virtual_machine_off());
}

#[tokio::test(start_paused = true)]
async fn start_failure_reports_error_until_retried() {
    let h = Harness::new(
        MockVmState {
            fail_start: true,
            ..MockVmState::default()
        },
        0,
        true,
        AnswerPolicy::yes(),
    );

    let err = h.connection.connect_to(NO_ASK).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Failed(ref m) if m.contains("start refused")), "{err:?}");
    assert_eq!(h.connection.state(), State::Error);
    assert!(h.connection.error_string().contains("start refused"));
    assert!(h.ui.active_warnings().contains(&Warning::StartFailed));

    h.vm.state.lock().fail_start = false;
    h.connection.connect_to(NO_ASK).await.unwrap();
    assert_eq!(h.connection.state(), State::Connected);
    assert!(h.connection.error_string().is_empty());
    assert!(!h.ui.active_warnings().contains(&Warning::StartFailed));
}

#[tokio::test(start_paused = true)]
async fn start_times_out_when_vm_never_comes_up() {
    let h = Harness::new(
        MockVmState {
            start_powers_on: false,
            ..MockVmState::default()
        },
        0,
        true,
        AnswerPolicy::yes(),
    );

    let started = tokio::time::Instant::now();
    let err = h.connection.connect_to(NO_ASK).await.unwrap_err();

    assert!(matches!(err, ConnectionError::Failed(_)));
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(h.connection.status().vm_state, VmState::StartingError);
}

#[tokio::test(start_paused = true)]
async fn lost_connection_is_reestablished() {
    let h = Harness::new(running_vm(), 0, true, AnswerPolicy::yes());
    h.connection.connect_to(NO_ASK).await.unwrap();
    let mut events = h.connection.subscribe();

    h.connector.lose_connections();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.connection.state(), State::Connected);
    assert_eq!(
        state_changes(&drain(&mut events)),
        vec![State::Connecting, State::Connected]
    );
    // Guest initialization runs once per boot.
    assert_eq!(h.vm.count("init-guest"), 1);
}

#[tokio::test(start_paused = true)]
async fn gives_up_connecting_when_user_declines_to_keep_trying() {
    let policy = AnswerPolicy::yes().with(Question::RetryConnecting, false);
    let h = Harness::new(running_vm(), u32::MAX, true, policy);

    let err = h.connection.connect_to(NO_ASK).await.unwrap_err();

    assert!(matches!(err, ConnectionError::Failed(ref m) if m.contains("connection reset")), "{err:?}");
    let status = h.connection.status();
    assert_eq!(status.state, State::Error);
    assert_eq!(status.ssh_state, SshState::ConnectingError);
    // The VM was started elsewhere: the grace period starts at the first
    // attempt, not at boot.
    assert!(h.connector.attempts() >= 30);
}

// ---------------------------------------------------------------------------
// Disconnecting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_shuts_guest_down_and_commits() {
    let h = Harness::new(stopped_vm(), 0, true, AnswerPolicy::yes());
    h.connection.connect_to(NO_ASK).await.unwrap();
    let mut events = h.connection.subscribe();

    h.connection.disconnect_from().await.unwrap();

    assert_eq!(h.connection.state(), State::Disconnected);
    assert!(h.connection.is_virtual_machine_off());
    assert!(!h.vm.is_running());
    let calls = h.vm.calls();
    assert_eq!(&calls[calls.len() - 2..], ["shutdown", "commit"]);
    assert_eq!(h.vm.count("stop"), 0);

    let events = drain(&mut events);
    assert_eq!(
        state_changes(&events),
        vec![State::Disconnecting, State::Closing, State::Disconnected]
    );
    assert!(events.contains(&ConnectionEvent::VirtualMachineOffChanged(true)));
}

#[tokio::test(start_paused = true)]
async fn disconnect_keeps_vm_started_elsewhere_when_user_says_no() {
    let h = Harness::new(running_vm(), 0, true, AnswerPolicy::yes().with(Question::CloseVm, false));
    h.connection.connect_to(NO_ASK).await.unwrap();

    h.connection.disconnect_from().await.unwrap();

    assert_eq!(h.connection.state(), State::Disconnected);
    assert!(h.vm.is_running());
    assert_eq!(h.vm.count("shutdown"), 0);
    assert_eq!(h.connection.status().ssh_state, SshState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn soft_close_timeout_falls_back_to_power_off() {
    let h = Harness::new(stopped_vm(), 0, false, AnswerPolicy::yes());
    h.connection.connect_to(NO_ASK).await.unwrap();

    let started = tokio::time::Instant::now();
    h.connection.disconnect_from().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(h.vm.count("shutdown"), 1);
    assert_eq!(h.vm.count("stop"), 1);
    assert_eq!(h.vm.count("commit"), 1);
    assert_eq!(h.connection.status().vm_state, VmState::Off);
}

#[tokio::test(start_paused = true)]
async fn unreachable_guest_shutdown_falls_back_to_power_off_at_once() {
    let h = Harness::new(stopped_vm(), 0, true, AnswerPolicy::yes());
    h.connection.connect_to(NO_ASK).await.unwrap();
    h.connector.refuse_shutdown();

    let started = tokio::time::Instant::now();
    h.connection.disconnect_from().await.unwrap();

    // No waiting out the 20 s soft-close timeout.
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    assert_eq!(h.vm.count("shutdown unreachable"), 1);
    assert_eq!(h.vm.count("shutdown"), 0);
    assert_eq!(h.vm.count("stop"), 1);
    assert_eq!(h.vm.count("commit"), 1);
    assert_eq!(h.connection.status().vm_state, VmState::Off);
}

#[tokio::test(start_paused = true)]
async fn vm_refusing_to_stop_becomes_zombie() {
    let h = Harness::new(
        MockVmState {
            stop_powers_off: false,
            ..MockVmState::default()
        },
        0,
        false,
        AnswerPolicy::yes(),
    );
    h.connection.connect_to(NO_ASK).await.unwrap();

    let err = h.connection.disconnect_from().await.unwrap_err();

    assert!(matches!(err, ConnectionError::Failed(_)));
    assert_eq!(h.connection.status().vm_state, VmState::Zombie);
    assert_eq!(h.connection.state(), State::Disconnected);
    assert!(h.ui.active_warnings().contains(&Warning::UnableToCloseVm));
}

// ---------------------------------------------------------------------------
// Lock-down
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn lock_down_gives_up_after_retries_and_leaves_a_zombie() {
    let policy = AnswerPolicy::yes().with(Question::RetryLockingDown, false);
    let h = Harness::new(
        MockVmState {
            stop_powers_off: false,
            ..MockVmState::default()
        },
        0,
        false,
        policy,
    );
    h.connection.connect_to(NO_ASK).await.unwrap();
    let mut events = h.connection.subscribe();

    let started = tokio::time::Instant::now();
    let err = h.connection.lock_down(true).await.unwrap_err();

    assert_eq!(err, ConnectionError::LockDownFailed);
    // Soft close, then two hard attempts before asking.
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(h.vm.count("shutdown"), 1);
    assert_eq!(h.vm.count("stop"), 2);

    let status = h.connection.status();
    assert_eq!(status.vm_state, VmState::Zombie);
    assert_eq!(status.state, State::Disconnected);
    assert!(!status.locked_down);
    assert!(!h.vm.core().is_locked_down());
    assert!(drain(&mut events).contains(&ConnectionEvent::LockDownFailed));

    // No reconnect after a failed lock-down.
    h.connection.lock_down(false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.connection.state(), State::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn lock_down_retries_a_failing_power_off_once_per_timeout() {
    let policy = AnswerPolicy::yes().with(Question::RetryLockingDown, false);
    let h = Harness::new(
        MockVmState {
            fail_stop: true,
            ..MockVmState::default()
        },
        0,
        false,
        policy,
    );
    h.connection.connect_to(NO_ASK).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = h.connection.lock_down(true).await.unwrap_err();

    assert_eq!(err, ConnectionError::LockDownFailed);
    // Each failed stop waits out the hard-close timeout before the next.
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(h.vm.count("stop"), 2);
    assert_eq!(h.connection.status().vm_state, VmState::Zombie);
}

#[tokio::test(start_paused = true)]
async fn lock_down_excludes_competing_requests() {
    let h = Harness::new(stopped_vm(), 0, true, AnswerPolicy::yes());

    h.connection.lock_down(true).await.unwrap();
    assert!(h.connection.is_locked_down());
    assert!(h.vm.core().is_locked_down());

    assert_eq!(h.connection.connect_to(NO_ASK).await, Err(ConnectionError::LockedDown));
    assert_eq!(h.connection.disconnect_from().await, Err(ConnectionError::LockedDown));
    assert_eq!(h.connection.refresh().await, Err(ConnectionError::LockedDown));
    assert!(h.ui.active_warnings().contains(&Warning::VmLocked));

    // Locking again is a no-op.
    h.connection.lock_down(true).await.unwrap();
    h.vm.set_memory_size_mb(4096).await.unwrap();

    h.connection.lock_down(false).await.unwrap();
    assert!(!h.connection.is_locked_down());
    assert!(!h.vm.core().is_locked_down());
    assert!(h.vm.set_cpu_count(4).await.is_err());
    assert_eq!(h.vm.calls(), vec!["memory 4096"]);
}

#[tokio::test(start_paused = true)]
async fn lock_down_closes_and_release_reconnects() {
    let h = Harness::new(stopped_vm(), 0, true, AnswerPolicy::yes());
    h.connection.connect_to(NO_ASK).await.unwrap();

    h.connection.lock_down(true).await.unwrap();
    assert!(h.connection.is_virtual_machine_off());
    assert!(h.connection.is_locked_down());
    h.vm.take_snapshot("before-upgrade").await.unwrap();

    h.connection.lock_down(false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.connection.state(), State::Connected);
    assert_eq!(h.vm.count("start"), 2);
    assert_eq!(h.vm.count("snapshot before-upgrade"), 1);
}

#[tokio::test(start_paused = true)]
async fn lock_down_of_vm_started_elsewhere_asks_first() {
    let h = Harness::new(running_vm(), 0, true, AnswerPolicy::yes().with(Question::ResetVm, false));

    let err = h.connection.lock_down(true).await.unwrap_err();

    assert_eq!(err, ConnectionError::LockDownFailed);
    assert!(h.vm.is_running());
    assert_eq!(h.vm.count("shutdown"), 0);
    assert!(!h.connection.is_locked_down());
}

// ---------------------------------------------------------------------------
// Polling and concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn polling_a_settled_vm_emits_nothing() {
    let h = Harness::new(stopped_vm(), 0, true, AnswerPolicy::yes());
    h.connection.refresh().await.unwrap();
    let mut events = h.connection.subscribe();
    let before = h.connection.status();

    for _ in 0..5 {
        h.connection.refresh().await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(drain(&mut events).is_empty());
    assert_eq!(h.connection.status(), before);
    // Five refreshes plus periodic polls.
    assert!(h.vm.state.lock().probes >= 10);
}

#[tokio::test(start_paused = true)]
async fn inactive_application_stops_polling() {
    let h = Harness::new(stopped_vm(), 0, true, AnswerPolicy::yes());
    h.connection.set_application_active(false);
    h.connection.refresh().await.unwrap();
    let probes = h.vm.state.lock().probes;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.vm.state.lock().probes, probes);
}

#[tokio::test(start_paused = true)]
async fn vm_started_elsewhere_is_noticed_by_polling() {
    let h = Harness::new(stopped_vm(), 0, true, AnswerPolicy::yes());
    h.connection.set_auto_connect(true);
    h.connection.refresh().await.unwrap();

    h.vm.state.lock().running = true;
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(h.connection.state(), State::Connected);
    assert_eq!(h.vm.count("start"), 0);
}

#[tokio::test(start_paused = true)]
async fn second_operation_is_rejected_while_busy() {
    let h = Harness::new(stopped_vm(), 2, true, AnswerPolicy::yes());

    let connection = h.connection.clone();
    let first = tokio::spawn(async move { connection.connect_to(NO_ASK).await });
    tokio::task::yield_now().await;

    let second = h.connection.disconnect_from().await;

    assert_eq!(second, Err(ConnectionError::Busy(Operation::Connect)));
    first.await.unwrap().unwrap();
    assert_eq!(h.connection.state(), State::Connected);
}

#[tokio::test(start_paused = true)]
async fn changed_ssh_parameters_trigger_reconnect() {
    let h = Harness::new(running_vm(), 0, true, AnswerPolicy::yes());
    h.connection.connect_to(NO_ASK).await.unwrap();
    let attempts = h.connector.attempts();

    h.connection.set_ssh_parameters(vmlink::ssh::SshParameters {
        port: 2300,
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.connection.state(), State::Connected);
    assert_eq!(h.connector.attempts(), attempts + 1);
}

#[tokio::test(start_paused = true)]
async fn short_timeouts_are_honoured() {
    let options = vmlink::connection::ConnectionOptions {
        timeouts: Timeouts {
            vm_start: Duration::from_secs(3),
            ..Timeouts::default()
        },
        ..test_options()
    };
    let h = Harness::with_options(
        MockVmState {
            start_powers_on: false,
            ..MockVmState::default()
        },
        0,
        true,
        AnswerPolicy::yes(),
        options,
    );

    let started = tokio::time::Instant::now();
    h.connection.connect_to(NO_ASK).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
}
