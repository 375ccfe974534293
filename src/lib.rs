//! Control groups partition processes into named hierarchies, one per
//! resource controller, each exposed by the kernel as a pseudo-filesystem.
//! This crate hides the filesystem plumbing behind a typed API: groups are
//! described as plain values, materialised and synchronised against the
//! mounted hierarchies, and threads are placed into them directly or
//! through the `cgrules.conf` placement policy.

mod common;
mod tasks;
mod test;

pub mod cgroup;
pub mod context;
pub mod error;
pub mod iter;
pub mod mount;
pub mod rules;

pub use cgroup::{Cgroup, CgroupController, ControlValue};
pub use context::{global, Context};
pub use error::{Error, Result};
pub use iter::{FileKind, Stat, StatReader, TaskReader, TreeEntry, TreeWalk};
pub use mount::{MountEntry, MAX_CONTROLLERS};
pub use rules::{Rule, RulePlacement, RuleSource, RuleSubject, RULES_CONF_PATH};
