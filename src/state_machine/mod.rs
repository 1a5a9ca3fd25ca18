//! The two coupled state machines behind [`crate::connection::VmConnection`].
//!
//! ```text
//! VM machine                                   SSH machine (meaningful while VM is Running)
//!
//! Off ──► AskBeforeStarting ──► Preparing      NotConnected ──► Connecting ──► Connected
//!  ▲  │           │                │                                 │  ▲          │  │
//!  │  │           ▼                ▼                                 ▼  │          │  ▼
//!  │  └──────► StartingError ◄── Starting                   ConnectingError   ConnectionLost
//!  │                                  │                                            │
//!  │                                  ▼                   Disconnecting ◄──────────┘
//!  │                               Running                      │
//!  │                                  │                         ▼
//!  │          Committing ◄── SoftClosing ──► HardClosing   Disconnected
//!  └──────────────┘                              │
//!                                                ▼
//!                                             Zombie
//! ```
//!
//! Both are statig machines that take the connection actor as context.
//! After every event the actor dispatches [`Step`] to each of them until
//! neither changes state. The externally visible [`State`] is a pure
//! function of the pair, see [`external_state`].

use std::fmt;

use serde::Serialize;

pub mod ssh_sm;
pub mod vm_sm;

/// The only event either machine handles: evaluate the current state's
/// conditions once. `round` is the settling round it was dispatched in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Step {
    pub(crate) round: usize,
}

/// Lifecycle of the virtual machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VmState {
    Off,
    AskBeforeStarting,
    Preparing,
    Starting,
    StartingError,
    Running,
    SoftClosing,
    HardClosing,
    Committing,
    /// Refused to power off; left running.
    Zombie,
}

/// Lifecycle of the SSH connection to a running guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SshState {
    NotConnected,
    Connecting,
    ConnectingError,
    Connected,
    Disconnecting,
    Disconnected,
    ConnectionLost,
}

/// What the rest of the application sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    Disconnected,
    Starting,
    Connecting,
    Error,
    Connected,
    Disconnecting,
    Closing,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Disconnected => "disconnected",
            State::Starting => "starting",
            State::Connecting => "connecting",
            State::Error => "error",
            State::Connected => "connected",
            State::Disconnecting => "disconnecting",
            State::Closing => "closing",
        })
    }
}

/// Map the internal pair onto the external state. Total over all pairs.
pub fn external_state(vm: VmState, ssh: SshState) -> State {
    match vm {
        VmState::Off | VmState::Zombie => State::Disconnected,
        VmState::AskBeforeStarting | VmState::Preparing | VmState::Starting => State::Starting,
        VmState::StartingError => State::Error,
        VmState::SoftClosing | VmState::HardClosing | VmState::Committing => State::Closing,
        VmState::Running => match ssh {
            SshState::NotConnected | SshState::Disconnected => State::Disconnected,
            SshState::Connecting | SshState::ConnectionLost => State::Connecting,
            SshState::ConnectingError => State::Error,
            SshState::Connected => State::Connected,
            SshState::Disconnecting => State::Disconnecting,
        },
    }
}
