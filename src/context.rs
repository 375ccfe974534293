//! Process-wide library state and the group synchroniser.
//!
//! A [`Context`] owns the two shared structures of the library: the mount
//! table and the placement rules. Both sit behind reader-writer locks; the
//! only mount-table writer is [`Context::init`], the only rules writers are
//! the rule loaders. Readers snapshot what they need and release the lock
//! before touching the filesystem.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nix::unistd::{chown, Gid, Uid};

use crate::cgroup::Cgroup;
use crate::common::{self, TASKS_FILE};
use crate::error::{Error, Result};
use crate::mount::{MountEntry, MountTable};
use crate::rules::Rule;

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub struct Context {
    mounts: RwLock<Option<MountTable>>,
    pub(crate) rules: RwLock<Vec<Rule>>,
}

static GLOBAL: Context = Context::new();

/// The process-wide context. Convenient for programs that treat the library
/// as a singleton the way the companion tools do; everything also works on
/// a caller-owned [`Context`].
pub fn global() -> &'static Context {
    &GLOBAL
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// An uninitialised context. Every operation fails with
    /// [`Error::NotInitialised`] until [`Context::init`] has succeeded.
    pub const fn new() -> Self {
        Context {
            mounts: RwLock::new(None),
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Discovers the mounted controller hierarchies and marks the context
    /// ready. May be called again to pick up mount changes; the table is
    /// replaced wholesale.
    pub fn init(&self) -> Result<()> {
        let table = MountTable::discover()?;
        *write_lock(&self.mounts) = Some(table);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn init_with_entries(&self, entries: Vec<MountEntry>) {
        *write_lock(&self.mounts) = Some(MountTable::from_entries(entries));
    }

    pub(crate) fn with_table<T>(&self, f: impl FnOnce(&MountTable) -> Result<T>) -> Result<T> {
        let guard = read_lock(&self.mounts);
        match guard.as_ref() {
            Some(table) => f(table),
            None => Err(Error::NotInitialised),
        }
    }

    pub(crate) fn ensure_initialised(&self) -> Result<()> {
        self.with_table(|_| Ok(()))
    }

    /// Directory paths of `cgroup` under each of its declared controllers,
    /// in declaration order. Fails when any declared controller has no
    /// mounted hierarchy.
    pub(crate) fn controller_paths(&self, cgroup: &Cgroup) -> Result<Vec<PathBuf>> {
        self.with_table(|table| {
            cgroup
                .controllers()
                .iter()
                .map(|controller| {
                    table
                        .build_path(Some(cgroup.name()), controller.name())
                        .ok_or(Error::SubsystemNotMounted)
                })
                .collect()
        })
    }

    /// Materialises `cgroup`: creates each controller directory, optionally
    /// hands it to its owners, and applies the declared attribute values.
    ///
    /// The kernel exposes some attribute files read-only and creates others
    /// only under certain configurations, so a failed attribute write does
    /// not stop the remaining writes; the first such failure is reported
    /// once everything has been attempted. Directory creation and ownership
    /// failures abort immediately. On a partial failure the filesystem keeps
    /// whatever was reached; `delete` cleans up.
    pub fn create(&self, cgroup: &Cgroup, ignore_ownership: bool) -> Result<()> {
        let paths = self.controller_paths(cgroup)?;
        let mut first_write_err = None;

        for (controller, dir) in cgroup.controllers().iter().zip(&paths) {
            common::mkdir_p(dir)?;

            if !ignore_ownership {
                tracing::debug!("changing ownership of {}", dir.display());
                let (uid, gid) = cgroup.control_owner();
                common::chown_recursive(dir, uid, gid)?;
            }

            for value in controller.values() {
                if let Err(err) = common::write_attribute(&dir.join(value.name()), value.value()) {
                    tracing::warn!("failed to set {} on {}: {}", value.name(), dir.display(), err);
                    first_write_err.get_or_insert(err);
                }
            }

            if !ignore_ownership {
                let (uid, gid) = cgroup.tasks_owner();
                chown(&dir.join(TASKS_FILE), Some(uid), Some(gid))
                    .map_err(common::errno_error)?;
            }
        }

        match first_write_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Applies `cgroup`'s attribute values to an existing group. No
    /// directories are created and no ownership is touched; here a write
    /// failure is a real problem and propagates immediately.
    pub fn modify(&self, cgroup: &Cgroup) -> Result<()> {
        let paths = self.controller_paths(cgroup)?;
        for (controller, dir) in cgroup.controllers().iter().zip(&paths) {
            for value in controller.values() {
                common::write_attribute(&dir.join(value.name()), value.value())?;
            }
        }
        Ok(())
    }

    /// Removes `cgroup` from every declared controller, first migrating any
    /// resident tasks into the parent group so the kernel will allow the
    /// removal.
    ///
    /// Without `ignore_migration` the first failure stops the walk and is
    /// returned. With it, a failed migration is followed by a second pass
    /// that removes whatever directories still exist, treating an already
    /// missing directory as success.
    pub fn delete(&self, cgroup: &Cgroup, ignore_migration: bool) -> Result<()> {
        let paths = self.controller_paths(cgroup)?;

        let mut failure = None;
        for dir in &paths {
            if let Err(err) = migrate_and_remove(dir) {
                failure = Some(err);
                break;
            }
        }

        let Some(err) = failure else { return Ok(()) };
        if !ignore_migration {
            return Err(err);
        }

        tracing::debug!("task migration failed ({}), removing directories anyway", err);
        let mut result = Ok(());
        for dir in &paths {
            match fs::remove_dir(dir) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    if result.is_ok() {
                        result = Err(Error::Other(err));
                    }
                }
            }
        }
        result
    }

    /// Reads the group called `name` back from the filesystem. Controllers
    /// under which the group does not exist are skipped; a group that exists
    /// nowhere yields [`Error::DoesNotExist`]. Ownership is taken from the
    /// `tasks` file and the attribute files on disk.
    pub fn load(&self, name: &str) -> Result<Cgroup> {
        let entries: Vec<MountEntry> = self.with_table(|table| Ok(table.entries().to_vec()))?;

        let mut cgroup = Cgroup::new(name);
        let mut found = false;

        for entry in &entries {
            let mut dir = entry.mount_point.clone();
            if !name.is_empty() {
                dir.push(name);
            }
            if !dir.is_dir() {
                continue;
            }
            found = true;

            let tasks_meta = fs::metadata(dir.join(TASKS_FILE))?;
            cgroup.set_tasks_owner(
                Uid::from_raw(tasks_meta.uid()),
                Gid::from_raw(tasks_meta.gid()),
            );

            let prefix = format!("{}.", entry.controller);
            let mut control_owner = None;
            let mut values = Vec::new();
            for dirent in fs::read_dir(&dir)? {
                let dirent = dirent?;
                let file_name = dirent.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                if !file_name.starts_with(&prefix) {
                    continue;
                }
                let Ok(meta) = dirent.metadata() else { continue };
                if !meta.is_file() {
                    continue;
                }
                control_owner = Some((meta.uid(), meta.gid()));
                match common::read_first_token(&dirent.path()) {
                    Ok(Some(value)) => values.push((file_name.to_owned(), value)),
                    Ok(None) | Err(_) => {
                        // Write-only and conditional files cannot be read back.
                        tracing::debug!("skipping unreadable attribute {}", file_name);
                    }
                }
            }
            values.sort();

            let controller = cgroup.add_controller(&entry.controller)?;
            for (value_name, value) in values {
                controller.add_value(&value_name, &value)?;
            }
            if let Some((uid, gid)) = control_owner {
                cgroup.set_control_owner(Uid::from_raw(uid), Gid::from_raw(gid));
            }
        }

        if !found {
            return Err(Error::DoesNotExist);
        }
        Ok(cgroup)
    }

    /// Creates `cgroup` with the attribute values its parent group currently
    /// has: resolves the parent name, loads it, deep-copies its controllers
    /// into `cgroup` and then runs [`Context::create`].
    pub fn create_from_parent(&self, cgroup: &mut Cgroup, ignore_ownership: bool) -> Result<()> {
        let parent_name = self.find_parent(cgroup.name())?;
        tracing::debug!(
            "parent of group {} is {}",
            cgroup.name(),
            if parent_name.is_empty() { "<root>" } else { parent_name.as_str() }
        );
        let parent = self.load(&parent_name)?;
        cgroup.copy_from(&parent);
        self.create(cgroup, ignore_ownership)
    }

    /// Name of `name`'s parent group. When the group sits directly under a
    /// hierarchy mount point (the mount boundary shows up as a device
    /// change), the parent is the hierarchy root, spelled as the empty name.
    fn find_parent(&self, name: &str) -> Result<String> {
        let child = self.with_table(|table| {
            let entry = table.entries().first().ok_or(Error::NotMounted)?;
            Ok(entry.mount_point.join(name))
        })?;

        let dir = child.parent().ok_or(Error::Failed)?;
        let dir_dev = fs::metadata(dir)?.dev();
        let above_dev = fs::metadata(dir.join(".."))?.dev();
        if dir_dev != above_dev {
            return Ok(String::new());
        }

        Ok(Path::new(name)
            .parent()
            .and_then(Path::to_str)
            .unwrap_or("")
            .to_owned())
    }
}

/// Moves every task of the group at `dir` into the parent group, then
/// removes the now empty directory.
fn migrate_and_remove(dir: &Path) -> Result<()> {
    let parent_tasks_path = dir.join("..").join(TASKS_FILE);
    let mut parent_tasks = OpenOptions::new()
        .append(true)
        .open(&parent_tasks_path)
        .map_err(|err| {
            tracing::debug!("cannot open {}: {}", parent_tasks_path.display(), err);
            Error::NotAllowed
        })?;

    let group_tasks = File::open(dir.join(TASKS_FILE)).map_err(|err| {
        tracing::debug!("cannot open tasks of {}: {}", dir.display(), err);
        Error::NotAllowed
    })?;

    for line in BufReader::new(group_tasks).lines() {
        let line = line?;
        let tid = line.trim();
        if tid.is_empty() {
            continue;
        }
        writeln!(parent_tasks, "{tid}")?;
    }

    fs::remove_dir(dir)?;
    Ok(())
}
