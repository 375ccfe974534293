//! Filesystem primitives shared by the synchroniser and task placement.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Uid};

use crate::error::{Error, Result};

pub(crate) const TASKS_FILE: &str = "tasks";

pub(crate) const DIR_MODE: u32 = 0o775;
pub(crate) const FILE_MODE: u32 = 0o664;

pub(crate) fn errno_error(errno: nix::errno::Errno) -> Error {
    Error::Other(io::Error::from_raw_os_error(errno as i32))
}

/// Writes one controller attribute file, replacing its previous content.
/// The value is passed through as-is; the kernel accepts values with or
/// without a trailing newline.
pub(crate) fn write_attribute(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|err| classify_attribute_error(path, err))?;
    file.write_all(value.as_bytes())?;
    Ok(())
}

/// An attribute open failure is ambiguous: the group may exist with an
/// unwritable file, or the whole hierarchy may be missing. Probing the
/// sibling `tasks` file tells the two apart, since every materialised group
/// directory has one.
fn classify_attribute_error(path: &Path, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::PermissionDenied => {
            let tasks = path.parent().map(|dir| dir.join(TASKS_FILE));
            match tasks.map(|tasks| File::open(tasks)) {
                Some(Err(probe)) if probe.kind() == io::ErrorKind::NotFound => {
                    Error::SubsystemNotMounted
                }
                _ => Error::NotAllowed,
            }
        }
        io::ErrorKind::NotFound => Error::ValueDoesNotExist,
        _ => Error::Other(err),
    }
}

/// Reads the first whitespace-delimited token of an attribute file.
/// Multi-line `*.stat` files go through the stats reader instead.
pub(crate) fn read_first_token(path: &Path) -> Result<Option<String>> {
    let mut contents = String::new();
    File::open(path)
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => Error::ValueDoesNotExist,
            _ => Error::Other(err),
        })?
        .read_to_string(&mut contents)?;
    Ok(contents.split_whitespace().next().map(str::to_owned))
}

/// `mkdir -p`, one path segment at a time. An already existing segment is
/// fine; permission failures distinguish ownership problems from everything
/// else.
pub(crate) fn mkdir_p(path: &Path) -> Result<()> {
    let mut prefix = PathBuf::new();
    for component in path.components() {
        prefix.push(component);
        match fs::create_dir(&prefix) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                return Err(Error::NotOwner)
            }
            Err(err) => {
                tracing::debug!("mkdir {} failed: {}", prefix.display(), err);
                return Err(Error::NotAllowed);
            }
        }
    }
    Ok(())
}

/// Recursively hands a group directory to its owner: directories become
/// rwxrwxr-x, regular files rw-rw-r--.
pub(crate) fn chown_recursive(path: &Path, owner: Uid, group: Gid) -> Result<()> {
    chown(path, Some(owner), Some(group)).map_err(errno_error)?;
    let metadata = fs::metadata(path)?;
    let mode = if metadata.is_dir() { DIR_MODE } else { FILE_MODE };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;

    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            chown_recursive(&entry.path(), owner, group)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use nix::unistd::{getegid, geteuid};

    use super::*;
    use crate::test::set_fixture;

    #[test]
    fn test_write_attribute_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let file = set_fixture(tmp.path(), "cpu.shares", "a much longer old value").unwrap();

        write_attribute(&file, "512").expect("write attribute");

        assert_eq!(fs::read_to_string(&file).unwrap(), "512");
    }

    #[test]
    fn test_write_attribute_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = write_attribute(&tmp.path().join("cpu.shares"), "512").unwrap_err();
        assert!(matches!(err, Error::ValueDoesNotExist));
    }

    #[test]
    fn test_permission_error_with_tasks_sibling() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), TASKS_FILE, "").unwrap();
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);

        let err = classify_attribute_error(&tmp.path().join("cpu.shares"), denied);

        assert!(matches!(err, Error::NotAllowed));
    }

    #[test]
    fn test_permission_error_without_tasks_sibling() {
        let tmp = tempfile::tempdir().unwrap();
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);

        let err = classify_attribute_error(&tmp.path().join("cpu.shares"), denied);

        assert!(matches!(err, Error::SubsystemNotMounted));
    }

    #[test]
    fn test_read_first_token() {
        let tmp = tempfile::tempdir().unwrap();
        let file = set_fixture(tmp.path(), "cpu.shares", "512\n").unwrap();
        assert_eq!(read_first_token(&file).unwrap(), Some("512".to_owned()));

        let file = set_fixture(tmp.path(), "cpuset.cpus", "0-3 extra").unwrap();
        assert_eq!(read_first_token(&file).unwrap(), Some("0-3".to_owned()));

        let file = set_fixture(tmp.path(), "empty", "").unwrap();
        assert_eq!(read_first_token(&file).unwrap(), None);

        let err = read_first_token(&tmp.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::ValueDoesNotExist));
    }

    #[test]
    fn test_mkdir_p_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("students").join("alice");

        mkdir_p(&target).expect("create nested directories");
        assert!(target.is_dir());

        // A second run over the existing tree succeeds.
        mkdir_p(&target).expect("recreate existing directories");
    }

    #[test]
    fn test_chown_recursive_applies_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("g1");
        fs::create_dir(&dir).unwrap();
        let file = set_fixture(&dir, "cpu.shares", "512").unwrap();

        chown_recursive(&dir, geteuid(), getegid()).expect("chown tree");

        assert_eq!(fs::metadata(&dir).unwrap().mode() & 0o7777, DIR_MODE);
        assert_eq!(fs::metadata(&file).unwrap().mode() & 0o7777, FILE_MODE);
    }
}
