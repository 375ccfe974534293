#![cfg(test)]

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::context::Context;
use crate::mount::MountEntry;

pub fn set_fixture(dir: &Path, filename: &str, val: &str) -> Result<PathBuf> {
    let full_path = dir.join(filename);

    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&full_path)
        .with_context(|| format!("failed to open {full_path:?}"))?
        .write_all(val.as_bytes())
        .with_context(|| format!("failed to write to {full_path:?}"))?;

    Ok(full_path)
}

/// A context whose mount table points the given controllers at test
/// directories.
pub fn context_with(entries: &[(&str, &Path)]) -> Context {
    let entries = entries
        .iter()
        .map(|(controller, mount_point)| MountEntry {
            controller: (*controller).to_owned(),
            mount_point: mount_point.to_path_buf(),
        })
        .collect();
    let ctx = Context::new();
    ctx.init_with_entries(entries);
    ctx
}

/// Drops a rules configuration into `dir` and returns its path.
pub fn write_rules(dir: &Path, contents: &str) -> PathBuf {
    set_fixture(dir, "cgrules.conf", contents).expect("write rules configuration")
}
