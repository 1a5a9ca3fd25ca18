//! vmlink: keeps a build virtual machine and an SSH connection to it in the
//! state the user asked for.
//!
//! - [`command`]: serialized asynchronous execution of host tools
//! - [`vm`]: VirtualBox and docker backends behind one [`vm::VirtualMachine`] trait
//! - [`connection`]: the per-VM engine combining VM and SSH state machines
//! - [`ui`]: questions and warnings the engine raises

pub mod command;
pub mod config;
pub mod config_watcher;
pub mod connection;
pub mod logging;
pub mod paths;
pub mod ssh;
pub mod state_machine;
pub mod ui;
pub mod vm;
