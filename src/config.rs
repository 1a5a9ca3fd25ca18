//! `vmlink.toml`: which VM to drive and how to reach it.
//!
//! ```toml
//! [vm]
//! name = "build"
//! backend = "virtualbox"     # or "docker"
//!
//! [ssh]
//! port = 2222
//! user = "builder"
//!
//! [connection]
//! ask_before_start = true
//! ```
//!
//! Every key is optional. Environment variables override a few timing and
//! tool settings without touching the file (see [`crate::connection::ConnectionOptions::from_env`]).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectOptions, ConnectionOptions};
use crate::ssh::SshParameters;
use crate::vm::BackendKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub name: String,
    pub backend: BackendKind,
    /// Docker only: image repository, defaults to the VM name.
    pub image: Option<String>,
    /// VirtualBox only: start without a window.
    pub headless: bool,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            name: "vmlink-build".to_string(),
            backend: BackendKind::VirtualBox,
            image: None,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Ask before starting a stopped VM on connect.
    pub ask_before_start: bool,
    /// Connect automatically when the VM is found running.
    pub auto_connect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ask_before_start: true,
            auto_connect: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vm: VmSettings,
    pub ssh: SshParameters,
    pub connection: ConnectionSettings,
}

impl Config {
    /// Load `path`, or the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Engine options: the file's settings plus environment overrides.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            auto_connect: self.connection.auto_connect,
            ..ConnectionOptions::from_env()
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            ask_start_vm: self.connection.ask_before_start,
        }
    }
}

/// Commented template written by `vmlink init`.
pub fn default_config_content() -> String {
    r#"# vmlink configuration. Every key is optional; missing keys use defaults.
#
# The [ssh] section is reloaded while `vmlink connect --hold` runs.

[vm]
name = "vmlink-build"       # VirtualBox VM name or docker container name
backend = "virtualbox"      # "virtualbox" or "docker"
# image = "vmlink/build"    # docker only, defaults to the name
headless = true             # VirtualBox only

[ssh]
host = "127.0.0.1"
port = 2222                 # host port forwarded to the guest's sshd
user = "builder"
# private_key = "/home/me/.ssh/id_vmlink"
connection_timeout_secs = 30   # boot grace period before asking to keep retrying
shutdown_command = "sudo /sbin/poweroff"

[connection]
ask_before_start = true     # confirm before starting a stopped VM
auto_connect = false        # connect as soon as the VM is seen running
"#
    .to_string()
}

/// Write `content` to `path` unless the file exists. Returns whether it was
/// written.
pub fn ensure_default_config(path: &Path, content: &str) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    let write_error = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_error)?;
    }
    std::fs::write(path, content).map_err(write_error)?;
    Ok(true)
}
