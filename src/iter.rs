//! Lazy, resumable cursors over a hierarchy: the directory tree of a group,
//! the `tasks` file, and the `(name, value)` stream of a `*.stat` file.
//!
//! The tasks and stat readers expose an explicit cursor (`next_tid`,
//! `next_stat`) that reports [`Error::Eof`] when the stream is exhausted,
//! plus an [`Iterator`] adapter that turns `Eof` into the end of iteration.
//! Resources are released on drop.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use nix::unistd::Pid;
use serde::Serialize;

use crate::common::TASKS_FILE;
use crate::context::Context;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Dir,
    File,
    Other,
}

/// One visited entry of a tree walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Base name of the entry.
    pub name: String,
    /// Base name of the directory the entry was found in; empty for the
    /// walk root.
    pub parent: String,
    pub full_path: PathBuf,
    /// Distance from the walk root; the root itself is at depth 0.
    pub depth: usize,
    pub kind: FileKind,
}

enum Pending {
    Visit {
        path: PathBuf,
        parent: String,
        depth: usize,
    },
    Failed(Error),
}

/// Depth-first, pre-order walk over a group's directory tree. Symlinks are
/// followed when deciding what an entry is. A directory that cannot be read
/// is reported as an `Err` item in place of its children; the walk then
/// carries on with its siblings.
pub struct TreeWalk {
    stack: Vec<Pending>,
    max_depth: Option<usize>,
}

impl TreeWalk {
    fn new(root: PathBuf, max_depth: Option<usize>) -> Self {
        TreeWalk {
            stack: vec![Pending::Visit {
                path: root,
                parent: String::new(),
                depth: 0,
            }],
            max_depth,
        }
    }
}

impl Iterator for TreeWalk {
    type Item = Result<TreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let (path, parent, depth) = match self.stack.pop()? {
            Pending::Failed(err) => return Some(Err(err)),
            Pending::Visit {
                path,
                parent,
                depth,
            } => (path, parent, depth),
        };

        let kind = match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => FileKind::Dir,
            Ok(meta) if meta.is_file() => FileKind::File,
            _ => FileKind::Other,
        };
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let descend = kind == FileKind::Dir
            && self.max_depth.map_or(true, |limit| depth < limit);
        if descend {
            match fs::read_dir(&path) {
                Ok(entries) => {
                    let mut children: Vec<PathBuf> =
                        entries.filter_map(|entry| entry.ok().map(|entry| entry.path())).collect();
                    children.sort();
                    for child in children.into_iter().rev() {
                        self.stack.push(Pending::Visit {
                            path: child,
                            parent: name.clone(),
                            depth: depth + 1,
                        });
                    }
                }
                Err(err) => self.stack.push(Pending::Failed(Error::Other(err))),
            }
        }

        Some(Ok(TreeEntry {
            name,
            parent,
            full_path: path,
            depth,
            kind,
        }))
    }
}

/// Cursor over the thread ids resident in a group.
pub struct TaskReader {
    lines: Lines<BufReader<File>>,
}

impl TaskReader {
    /// The next resident thread id, or [`Error::Eof`] once the tasks file
    /// is exhausted.
    pub fn next_tid(&mut self) -> Result<Pid> {
        loop {
            let Some(line) = self.lines.next() else {
                return Err(Error::Eof);
            };
            let line = line?;
            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            let tid = token.parse::<i32>().map_err(|err| {
                Error::Other(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
            })?;
            return Ok(Pid::from_raw(tid));
        }
    }
}

impl Iterator for TaskReader {
    type Item = Result<Pid>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_tid() {
            Err(Error::Eof) => None,
            other => Some(other),
        }
    }
}

/// One entry of a controller's `*.stat` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub name: String,
    pub value: String,
}

/// Cursor over the `(name, value)` lines of a `{controller}.stat` file.
pub struct StatReader {
    lines: Lines<BufReader<File>>,
}

impl StatReader {
    /// The next `(name, value)` pair, or [`Error::Eof`] at the end of the
    /// stream. A line without both fields is malformed.
    pub fn next_stat(&mut self) -> Result<Stat> {
        let Some(line) = self.lines.next() else {
            return Err(Error::Eof);
        };
        let line = line?;
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(name), Some(value)) => Ok(Stat {
                name: name.to_owned(),
                value: value.to_owned(),
            }),
            _ => Err(Error::InvalidOperation),
        }
    }
}

impl Iterator for StatReader {
    type Item = Result<Stat>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_stat() {
            Err(Error::Eof) => None,
            other => Some(other),
        }
    }
}

impl Context {
    /// Starts a walk over `base_group`'s directory tree inside
    /// `controller`'s hierarchy. With `max_depth` of `Some(n)`, entries
    /// more than `n` levels below the walk root are pruned; the walk itself
    /// continues.
    pub fn walk_tree(
        &self,
        controller: &str,
        base_group: &str,
        max_depth: Option<usize>,
    ) -> Result<TreeWalk> {
        let root = self.with_table(|table| {
            table
                .build_path(Some(base_group), controller)
                .ok_or(Error::SubsystemNotMounted)
        })?;
        fs::metadata(&root).map_err(|_| Error::InvalidOperation)?;
        Ok(TreeWalk::new(root, max_depth))
    }

    /// Opens the tasks file of `group` under `controller`.
    pub fn tasks(&self, group: &str, controller: &str) -> Result<TaskReader> {
        let path = self.with_table(|table| {
            table
                .build_path(Some(group), controller)
                .ok_or(Error::SubsystemNotMounted)
        })?;
        let file = File::open(path.join(TASKS_FILE))?;
        Ok(TaskReader {
            lines: BufReader::new(file).lines(),
        })
    }

    /// Opens the `{controller}.stat` stream of `group`.
    pub fn read_stats(&self, controller: &str, group: &str) -> Result<StatReader> {
        let path = self.with_table(|table| {
            table
                .build_path(Some(group), controller)
                .ok_or(Error::SubsystemNotMounted)
        })?;
        let file = File::open(path.join(format!("{controller}.stat")))
            .map_err(|_| Error::InvalidOperation)?;
        Ok(StatReader {
            lines: BufReader::new(file).lines(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test::{context_with, set_fixture};

    fn sample_tree(root: &std::path::Path) {
        // g1/
        //   cpu.shares
        //   nested/
        //     deeper/
        //       cpu.shares
        let g1 = root.join("g1");
        fs::create_dir_all(g1.join("nested/deeper")).unwrap();
        set_fixture(&g1, "cpu.shares", "512").unwrap();
        set_fixture(&g1.join("nested/deeper"), "cpu.shares", "1024").unwrap();
    }

    #[test]
    fn test_walk_visits_everything_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", tmp.path())]);
        sample_tree(tmp.path());

        let entries: Vec<TreeEntry> = ctx
            .walk_tree("cpu", "g1", None)
            .expect("start walk")
            .collect::<Result<_>>()
            .expect("walk tree");

        let visited: Vec<(String, usize)> = entries
            .iter()
            .map(|entry| (entry.name.clone(), entry.depth))
            .collect();
        assert_eq!(
            visited,
            vec![
                ("g1".to_owned(), 0),
                ("cpu.shares".to_owned(), 1),
                ("nested".to_owned(), 1),
                ("deeper".to_owned(), 2),
                ("cpu.shares".to_owned(), 3),
            ]
        );

        assert_eq!(entries[0].kind, FileKind::Dir);
        assert_eq!(entries[0].parent, "");
        assert_eq!(entries[1].kind, FileKind::File);
        assert_eq!(entries[1].parent, "g1");
        assert_eq!(entries[4].parent, "deeper");
    }

    #[test]
    fn test_walk_prunes_below_max_depth() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", tmp.path())]);
        sample_tree(tmp.path());

        let entries: Vec<TreeEntry> = ctx
            .walk_tree("cpu", "g1", Some(1))
            .expect("start walk")
            .collect::<Result<_>>()
            .expect("walk tree");

        assert!(entries.iter().all(|entry| entry.depth <= 1));
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["g1", "cpu.shares", "nested"]);
    }

    #[test]
    fn test_walk_unknown_controller() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", tmp.path())]);

        assert!(matches!(
            ctx.walk_tree("blkio", "g1", None),
            Err(Error::SubsystemNotMounted)
        ));
        assert!(matches!(
            ctx.walk_tree("cpu", "absent", None),
            Err(Error::InvalidOperation)
        ));
    }

    #[test]
    fn test_task_reader_yields_tids_then_eof() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", tmp.path())]);

        let dir = tmp.path().join("g1");
        fs::create_dir(&dir).unwrap();
        set_fixture(&dir, TASKS_FILE, "100\n101\n102\n").unwrap();

        let mut reader = ctx.tasks("g1", "cpu").expect("open tasks");
        assert_eq!(reader.next_tid().unwrap(), Pid::from_raw(100));
        assert_eq!(reader.next_tid().unwrap(), Pid::from_raw(101));
        assert_eq!(reader.next_tid().unwrap(), Pid::from_raw(102));
        assert!(matches!(reader.next_tid(), Err(Error::Eof)));
        // Eof is sticky.
        assert!(matches!(reader.next_tid(), Err(Error::Eof)));
    }

    #[test]
    fn test_task_reader_as_iterator() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", tmp.path())]);

        let dir = tmp.path().join("g1");
        fs::create_dir(&dir).unwrap();
        set_fixture(&dir, TASKS_FILE, "1\n2\n").unwrap();

        let tids: Vec<Pid> = ctx
            .tasks("g1", "cpu")
            .expect("open tasks")
            .collect::<Result<_>>()
            .expect("read tids");
        assert_eq!(tids, vec![Pid::from_raw(1), Pid::from_raw(2)]);
    }

    #[test]
    fn test_stat_reader_streams_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpuacct", tmp.path())]);

        let dir = tmp.path().join("g1");
        fs::create_dir(&dir).unwrap();
        set_fixture(&dir, "cpuacct.stat", "user 4253\nsystem 1782\n").unwrap();

        let mut reader = ctx.read_stats("cpuacct", "g1").expect("open stats");
        assert_eq!(
            reader.next_stat().unwrap(),
            Stat {
                name: "user".to_owned(),
                value: "4253".to_owned()
            }
        );
        assert_eq!(
            reader.next_stat().unwrap(),
            Stat {
                name: "system".to_owned(),
                value: "1782".to_owned()
            }
        );
        assert!(matches!(reader.next_stat(), Err(Error::Eof)));
    }

    #[test]
    fn test_stat_reader_rejects_malformed_line() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", tmp.path())]);

        let dir = tmp.path().join("g1");
        fs::create_dir(&dir).unwrap();
        set_fixture(&dir, "cpu.stat", "orphan\n").unwrap();

        let mut reader = ctx.read_stats("cpu", "g1").expect("open stats");
        assert!(matches!(reader.next_stat(), Err(Error::InvalidOperation)));
    }

    #[test]
    fn test_stat_reader_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with(&[("cpu", tmp.path())]);
        fs::create_dir(tmp.path().join("g1")).unwrap();

        assert!(matches!(
            ctx.read_stats("cpu", "g1"),
            Err(Error::InvalidOperation)
        ));
    }
}
