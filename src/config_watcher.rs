//! Live reload of `vmlink.toml`.
//!
//! While a connection is held open, edits to the config file are picked up
//! and the new SSH parameters are pushed into the connection.
//!
//! ```rust,ignore
//! let watcher = ConfigFileWatcher::start(path, move |config| {
//!     connection.set_ssh_parameters(config.ssh);
//! })?;
//! ```

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::Config;

/// Watch the *parent directory* of `path` and call `on_change` whenever the
/// file is created or modified.
///
/// Editors that save through a temp file and a rename never modify the
/// original inode, so the file itself cannot be watched directly.
pub fn spawn_watcher<F>(path: &Path, on_change: F) -> notify::Result<RecommendedWatcher>
where
    F: Fn() + Send + 'static,
{
    let Some(target_filename) = path.file_name().map(|f| f.to_os_string()) else {
        return Err(notify::Error::generic("config path has no file name"));
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
        Ok(event) => {
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            let affects_target = event
                .paths
                .iter()
                .any(|p| p.file_name().is_some_and(|f| f == target_filename));
            if affects_target {
                on_change();
            }
        }
        Err(e) => warn!(error = %e, "config watch error"),
    })?;

    watcher.watch(&parent, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Owns the watcher; dropping it stops watching.
pub struct ConfigFileWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigFileWatcher {
    /// Start watching `path`. `on_reload` receives each successfully parsed
    /// version; files that fail to parse are logged and skipped.
    pub fn start<F>(path: PathBuf, on_reload: F) -> notify::Result<Self>
    where
        F: Fn(Config) + Send + 'static,
    {
        let watched = path.clone();
        let watcher = spawn_watcher(&path, move || match Config::load(&watched) {
            Ok(config) => {
                debug!(path = %watched.display(), "config reloaded");
                on_reload(config);
            }
            Err(e) => warn!(error = %e, "ignoring config change"),
        })?;

        Ok(Self {
            _watcher: watcher,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
