//! Host directories exposed to the guest.
//!
//! ```text
//! Host:  ~/src/project            (any absolute, existing directory)
//!              |
//!        VirtualBox shared folder "vmlink_workspace"
//!        or docker bind mount
//!              |
//! Guest: /home/builder/workspace
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::VmError;

/// Well-known shares. Each maps to a fixed mapping name and guest mount
/// point, so the guest image can mount them without extra configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedPath {
    Home,
    Workspace,
    Config,
    Ssh,
    Targets,
}

impl SharedPath {
    pub const ALL: [SharedPath; 5] = [
        SharedPath::Home,
        SharedPath::Workspace,
        SharedPath::Config,
        SharedPath::Ssh,
        SharedPath::Targets,
    ];

    /// Shared folder name (VirtualBox) and state-file key (docker).
    pub fn mapping_name(self) -> &'static str {
        match self {
            SharedPath::Home => "vmlink_home",
            SharedPath::Workspace => "vmlink_workspace",
            SharedPath::Config => "vmlink_config",
            SharedPath::Ssh => "vmlink_ssh",
            SharedPath::Targets => "vmlink_targets",
        }
    }

    pub fn guest_mount_point(self) -> &'static str {
        match self {
            SharedPath::Home => "/home/builder/share",
            SharedPath::Workspace => "/home/builder/workspace",
            SharedPath::Config => "/etc/vmlink/host-config",
            SharedPath::Ssh => "/etc/ssh/authorized_keys.d",
            SharedPath::Targets => "/srv/targets",
        }
    }

    pub fn from_mapping_name(name: &str) -> Option<SharedPath> {
        SharedPath::ALL.into_iter().find(|p| p.mapping_name() == name)
    }
}

impl fmt::Display for SharedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mapping_name())
    }
}

/// Validate a host path before handing it to a backend: absolute, existing,
/// a directory.
pub fn validate_host_path(path: &Path) -> Result<PathBuf, VmError> {
    if !path.is_absolute() {
        return Err(VmError::Invalid(format!(
            "shared path must be absolute: {}",
            path.display()
        )));
    }
    if !path.is_dir() {
        return Err(VmError::Invalid(format!(
            "shared path is not an existing directory: {}",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

/// `-v host:guest` arguments for `docker run`.
pub fn docker_volume_args<'a>(shares: impl IntoIterator<Item = (&'a String, &'a PathBuf)>) -> Vec<String> {
    shares
        .into_iter()
        .filter_map(|(name, host)| {
            let which = SharedPath::from_mapping_name(name)?;
            Some(["-v".to_string(), format!("{}:{}", host.display(), which.guest_mount_point())])
        })
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn mapping_names_round_trip() {
        for which in SharedPath::ALL {
            assert_eq!(SharedPath::from_mapping_name(which.mapping_name()), Some(which));
        }
        assert_eq!(SharedPath::from_mapping_name("other"), None);
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(validate_host_path(Path::new("relative/dir")).is_err());
    }

    #[test]
    fn missing_directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_host_path(&dir.path().join("absent")).is_err());
        assert_eq!(validate_host_path(dir.path()).unwrap(), dir.path());
    }

    #[test]
    fn docker_volume_args_skip_unknown_mappings() {
        let mut shares = BTreeMap::new();
        shares.insert("vmlink_workspace".to_string(), PathBuf::from("/src"));
        shares.insert("stray".to_string(), PathBuf::from("/x"));
        let args = docker_volume_args(&shares);
        assert_eq!(args, vec!["-v".to_string(), "/src:/home/builder/workspace".to_string()]);
    }
}
