//! Task placement: writing thread ids into `tasks` files.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use nix::unistd::{gettid, Pid};

use crate::cgroup::Cgroup;
use crate::common::TASKS_FILE;
use crate::context::Context;
use crate::error::{Error, Result};

impl Context {
    /// Places the thread `tid` into `cgroup` under every controller the
    /// group declares, or into the root group of every mounted hierarchy
    /// when no group is given. All declared controllers must be mounted.
    /// The first failing hierarchy stops the walk; earlier placements are
    /// left in place.
    pub fn attach(&self, cgroup: Option<&Cgroup>, tid: Pid) -> Result<()> {
        match cgroup {
            None => {
                let roots: Vec<_> = self.with_table(|table| {
                    Ok(table
                        .entries()
                        .iter()
                        .map(|entry| entry.mount_point.clone())
                        .collect())
                })?;
                for root in roots {
                    write_tid(&root.join(TASKS_FILE), tid)?;
                }
            }
            Some(cgroup) => {
                let paths = self.controller_paths(cgroup)?;
                for dir in paths {
                    write_tid(&dir.join(TASKS_FILE), tid)?;
                }
            }
        }
        Ok(())
    }

    /// Places the calling thread. Uses the kernel thread id, not the
    /// process id, so individual threads can be placed separately.
    pub fn attach_current(&self, cgroup: Option<&Cgroup>) -> Result<()> {
        self.attach(cgroup, gettid())
    }

    /// The group path `pid` currently occupies inside `controller`'s
    /// hierarchy, as reported by `/proc/<pid>/cgroup`.
    pub fn current_controller_path(&self, pid: Pid, controller: &str) -> Result<String> {
        self.ensure_initialised()?;
        let proc_path = format!("/proc/{}/cgroup", pid.as_raw());
        let contents = fs::read_to_string(&proc_path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => Error::DoesNotExist,
            _ => Error::Other(err),
        })?;
        parse_controller_path(&contents, controller).ok_or(Error::DoesNotExist)
    }
}

/// Picks `controller`'s group path out of `/proc/<pid>/cgroup` content.
/// Lines read `N:controller[,controller..]:path`.
pub(crate) fn parse_controller_path(contents: &str, controller: &str) -> Option<String> {
    for line in contents.lines() {
        let fields: Vec<&str> = line.splitn(3, ':').collect();
        if fields.len() < 3 {
            continue;
        }
        if fields[1].split(',').any(|name| name == controller) {
            return Some(fields[2].to_owned());
        }
    }
    None
}

fn write_tid(path: &Path, tid: Pid) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|err| match err.kind() {
            io::ErrorKind::PermissionDenied => Error::NotOwner,
            io::ErrorKind::NotFound => Error::DoesNotExist,
            _ => Error::NotAllowed,
        })?;
    write!(file, "{}", tid.as_raw())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test::{context_with, set_fixture};

    #[test]
    fn test_attach_writes_tid_under_every_controller() {
        let cpu_tmp = tempfile::tempdir().unwrap();
        let acct_tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", cpu_tmp.path()), ("cpuacct", acct_tmp.path())]);

        for tmp in [&cpu_tmp, &acct_tmp] {
            let dir = tmp.path().join("students/alice");
            fs::create_dir_all(&dir).unwrap();
            set_fixture(&dir, TASKS_FILE, "").unwrap();
        }

        let mut cgroup = Cgroup::new("students/alice");
        cgroup.add_controller("cpu").unwrap();
        cgroup.add_controller("cpuacct").unwrap();

        ctx.attach(Some(&cgroup), Pid::from_raw(7777)).expect("attach");

        for tmp in [&cpu_tmp, &acct_tmp] {
            let content =
                fs::read_to_string(tmp.path().join("students/alice").join(TASKS_FILE)).unwrap();
            assert_eq!(content, "7777");
        }
    }

    #[test]
    fn test_attach_without_group_targets_hierarchy_roots() {
        let cpu_tmp = tempfile::tempdir().unwrap();
        let mem_tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", cpu_tmp.path()), ("memory", mem_tmp.path())]);

        set_fixture(cpu_tmp.path(), TASKS_FILE, "").unwrap();
        set_fixture(mem_tmp.path(), TASKS_FILE, "").unwrap();

        ctx.attach(None, Pid::from_raw(4242)).expect("attach to roots");

        assert_eq!(
            fs::read_to_string(cpu_tmp.path().join(TASKS_FILE)).unwrap(),
            "4242"
        );
        assert_eq!(
            fs::read_to_string(mem_tmp.path().join(TASKS_FILE)).unwrap(),
            "4242"
        );
    }

    #[test]
    fn test_attach_missing_group() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", tmp.path())]);

        let mut cgroup = Cgroup::new("absent");
        cgroup.add_controller("cpu").unwrap();

        let err = ctx.attach(Some(&cgroup), Pid::from_raw(1)).unwrap_err();
        assert!(matches!(err, Error::DoesNotExist));
    }

    #[test]
    fn test_attach_unmounted_controller() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", tmp.path())]);

        let mut cgroup = Cgroup::new("g1");
        cgroup.add_controller("memory").unwrap();

        let err = ctx.attach(Some(&cgroup), Pid::from_raw(1)).unwrap_err();
        assert!(matches!(err, Error::SubsystemNotMounted));
    }

    #[test]
    fn test_parse_controller_path() {
        let contents = "4:cpu,cpuacct:/students/alice\n3:memory:/\n2:freezer:/jobs\n";

        assert_eq!(
            parse_controller_path(contents, "cpu").as_deref(),
            Some("/students/alice")
        );
        assert_eq!(
            parse_controller_path(contents, "cpuacct").as_deref(),
            Some("/students/alice")
        );
        assert_eq!(parse_controller_path(contents, "memory").as_deref(), Some("/"));
        assert_eq!(parse_controller_path(contents, "blkio"), None);
    }

    #[test]
    fn test_parse_controller_path_skips_malformed_lines() {
        let contents = "garbage\n1:cpu:/g1\n";
        assert_eq!(parse_controller_path(contents, "cpu").as_deref(), Some("/g1"));
    }
}
