//! Application directory structure for vmlink.
//!
//! Provides a single `VmlinkPaths` struct that resolves all standard directories
//! and ensures they exist on first use. Follows platform conventions:
//!
//! - Config:    `~/.config/vmlink/`  (human-editable, XDG-style on every platform)
//! - Data:      `~/Library/Application Support/org.vmlink.vmlink/` or `~/.local/share/vmlink/`
//! - State:     `<data>/state/`  (docker backend settings)
//! - Logs:      `~/Library/Logs/vmlink/` or `<data>/logs/`

use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const BUNDLE_ID: &str = "org.vmlink.vmlink";
const APP_NAME: &str = "vmlink";

pub const CONFIG_FILE_NAME: &str = "vmlink.toml";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct VmlinkPaths {
    /// Human-editable config: `~/.config/vmlink/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// Backend state files
    pub state: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl VmlinkPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        let config = resolve_config_dir(&home);
        let data = resolve_data_dir(&home);
        let logs = resolve_log_dir(&home);

        Some(Self {
            config,
            state: data.join("state"),
            data,
            logs,
        })
    }

    /// Everything below `root`, for tests and portable installs.
    pub fn under(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            data: root.join("data"),
            state: root.join("data").join("state"),
            logs: root.join("logs"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE_NAME)
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.state, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}
