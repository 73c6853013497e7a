//! Filesystem utilities for artifact staging.
//!
//! Common operations used while building and committing replacement images.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{IoContext, Result};

/// Suffix of a file that is still being written.
pub const INCOMPLETE_SUFFIX: &str = ".tmp";

/// The staging name for `path`: same directory, `.tmp` appended.
///
/// `rootfs-A.img` stages as `rootfs-A.img.tmp`, so a rename from one to the
/// other never crosses a filesystem boundary.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(INCOMPLETE_SUFFIX);
    path.with_file_name(name)
}

/// Remove a file, treating "not found" as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(e).io_context(|| format!("removing stale {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// Atomically move a file by renaming, with fallback to copy+delete.
///
/// Artifacts are built to a temp file and then moved to the final
/// destination, so readers see either the old file or the complete new one.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem: stage next to the destination, then rename.
            let staged = temp_sibling(dst);
            fs::copy(src, &staged).io_context(|| {
                format!("copying {} to {}", src.display(), staged.display())
            })?;
            fs::rename(&staged, dst).io_context(|| {
                format!("renaming {} to {}", staged.display(), dst.display())
            })?;
            fs::remove_file(src).io_context(|| format!("removing {}", src.display()))?;
            Ok(())
        }
    }
}

/// Sum of the apparent sizes of every regular file under `path`.
///
/// Symlinks are counted by their own length, not their target's.
pub fn dir_size(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry =
            entry.map_err(|e| crate::Error::io(format!("walking {}", path.display()), e.into()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let metadata = entry
            .metadata()
            .map_err(|e| crate::Error::io(format!("reading {}", entry.path().display()), e.into()))?;
        total = total.saturating_add(metadata.len());
    }
    Ok(total)
}

/// Whether `path` is a regular file (not a symlink to one).
pub fn is_regular_file(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_file())
        .unwrap_or(false)
}
