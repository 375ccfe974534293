//! Discovery and indexing of the kernel's controller hierarchies.

use std::path::PathBuf;

use procfs::process::Process;

use crate::error::{Error, Result};

/// Upper bound on tracked controller hierarchies.
pub const MAX_CONTROLLERS: usize = 32;

/// One controller and the place its hierarchy is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub controller: String,
    pub mount_point: PathBuf,
}

/// Ordered index of `controller -> mount point`, built once per
/// initialisation from the controllers the kernel registers and the cgroup
/// filesystems currently mounted.
#[derive(Debug, Default)]
pub(crate) struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Intersects `/proc/cgroups` with the process mount table. A controller
    /// is bound to the first cgroup mount listing it among its options;
    /// controllers without a mount are left out. No cgroup mount at all
    /// means the system cannot be driven.
    pub(crate) fn discover() -> Result<Self> {
        let controllers: Vec<String> = procfs::cgroups()?
            .into_iter()
            .map(|controller| controller.name)
            .collect();

        let mounts: Vec<_> = Process::myself()?
            .mountinfo()?
            .into_iter()
            .filter(|mount| mount.fs_type == "cgroup")
            .collect();

        let mut entries = Vec::new();
        for controller in controllers {
            let found = mounts.iter().find(|mount| {
                mount.super_options.contains_key(&controller)
                    || mount.mount_options.contains_key(&controller)
            });
            let Some(mount) = found else {
                tracing::debug!("controller {} has no mounted hierarchy", controller);
                continue;
            };
            if entries.len() == MAX_CONTROLLERS {
                return Err(Error::MaxExceeded);
            }
            tracing::debug!(
                "controller {} mounted at {}",
                controller,
                mount.mount_point.display()
            );
            entries.push(MountEntry {
                controller,
                mount_point: mount.mount_point.clone(),
            });
        }

        if entries.is_empty() {
            return Err(Error::NotMounted);
        }
        Ok(MountTable { entries })
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<MountEntry>) -> Self {
        MountTable { entries }
    }

    pub(crate) fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Absolute path of `group` inside `controller`'s hierarchy, or `None`
    /// when the controller is not mounted. An empty group name addresses the
    /// hierarchy root. The group name is joined verbatim; `..` segments pass
    /// through so callers can address a group's parent.
    pub(crate) fn build_path(&self, group: Option<&str>, controller: &str) -> Option<PathBuf> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.controller == controller)?;
        let mut path = entry.mount_point.clone();
        if let Some(group) = group {
            if !group.is_empty() {
                path.push(group);
            }
        }
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn sample_table() -> MountTable {
        MountTable::from_entries(vec![
            MountEntry {
                controller: "cpu".into(),
                mount_point: "/sys/fs/cgroup/cpu".into(),
            },
            MountEntry {
                controller: "memory".into(),
                mount_point: "/sys/fs/cgroup/memory".into(),
            },
        ])
    }

    #[test]
    fn test_build_path_with_group() {
        let table = sample_table();
        assert_eq!(
            table.build_path(Some("students/alice"), "cpu"),
            Some(Path::new("/sys/fs/cgroup/cpu/students/alice").to_path_buf())
        );
    }

    #[test]
    fn test_build_path_root() {
        let table = sample_table();
        assert_eq!(
            table.build_path(None, "memory"),
            Some(Path::new("/sys/fs/cgroup/memory").to_path_buf())
        );
        assert_eq!(
            table.build_path(Some(""), "memory"),
            Some(Path::new("/sys/fs/cgroup/memory").to_path_buf())
        );
    }

    #[test]
    fn test_build_path_unknown_controller() {
        let table = sample_table();
        assert_eq!(table.build_path(Some("g1"), "blkio"), None);
        assert_eq!(table.build_path(None, "blkio"), None);
    }

    #[test]
    fn test_parent_segments_pass_through() {
        let table = sample_table();
        assert_eq!(
            table.build_path(Some("g1/.."), "cpu"),
            Some(Path::new("/sys/fs/cgroup/cpu/g1/..").to_path_buf())
        );
    }

    #[test]
    fn test_order_is_preserved() {
        let table = sample_table();
        let names: Vec<&str> = table
            .entries()
            .iter()
            .map(|entry| entry.controller.as_str())
            .collect();
        assert_eq!(names, vec!["cpu", "memory"]);
    }
}
