//! Installing rebuilt filesystems into partitions.
//!
//! Nested images are replaced atomically: the artifact is staged next to the
//! target on the same filesystem, flushed, and renamed over it. A direct
//! filesystem partition is emptied and refilled in place; only the recovery
//! directory survives.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::artifact::filesystem::{is_regular_file, remove_if_exists, temp_sibling};
use crate::error::{Error, IoContext, Result};
use crate::host::MountOptions;
use crate::layout::locate_candidate;
use crate::session::{Partition, Session};

/// Directory fsck expects at the top of an ext filesystem.
pub const RECOVERY_DIR: &str = "lost+found";

/// Replace the nested image on `partition` with `artifact`.
///
/// The target is found with the same rule classification uses; when the
/// partition holds no regular file at all, the role's default name is
/// created. Returns the target's name relative to the partition root.
pub fn install_nested(
    session: &mut Session<'_>,
    partition: &Partition,
    artifact: &Path,
) -> Result<PathBuf> {
    let role = partition.role;
    let artifact_len = fs::metadata(artifact)
        .io_context(|| format!("reading {}", artifact.display()))?
        .len();

    let name = format!("install-{role}");
    session.with_mount(
        &partition.device,
        &name,
        MountOptions::writable(),
        |session, root| {
            let relative = locate_candidate(root, role.preferred_names())?
                .unwrap_or_else(|| PathBuf::from(role.default_name()));
            let target = root.join(&relative);
            if target.symlink_metadata().is_ok() && !is_regular_file(&target) {
                return Err(Error::InvalidInput(format!(
                    "{} on the {role} partition exists and is not a regular file",
                    relative.display()
                )));
            }

            let available = fs2::available_space(root);
            check_space(partition, &target, artifact, artifact_len, available)?;

            let staged = temp_sibling(&target);
            remove_if_exists(&staged)?;
            let installed = copy_durable(artifact, &staged).and_then(|()| {
                fs::rename(&staged, &target).io_context(|| {
                    format!("renaming {} to {}", staged.display(), target.display())
                })
            });
            if let Err(e) = installed {
                let _ = fs::remove_file(&staged);
                return Err(e);
            }

            session.host().sync();
            tracing::info!(
                "installed {} as {} on {}",
                artifact.display(),
                relative.display(),
                partition.device.display()
            );
            Ok(relative)
        },
    )
}

/// Empty a direct filesystem partition and copy `source_dir` into it.
///
/// Every top-level entry except [`RECOVERY_DIR`] is removed first. This is
/// not atomic: a failure part way leaves the partition partially filled.
pub fn wipe_and_fill_direct(
    session: &mut Session<'_>,
    partition: &Partition,
    source_dir: &Path,
) -> Result<()> {
    if !source_dir.is_dir() {
        return Err(Error::MissingInput {
            what: "source tree",
            path: source_dir.to_path_buf(),
        });
    }

    let name = format!("fill-{}", partition.role);
    session.with_mount(
        &partition.device,
        &name,
        MountOptions::writable(),
        |session, root| {
            wipe(root)?;
            session.host().copy_tree(source_dir, root)?;
            session.host().sync();
            Ok(())
        },
    )
}

fn wipe(root: &Path) -> Result<()> {
    for entry in fs::read_dir(root).io_context(|| format!("reading {}", root.display()))? {
        let entry = entry.io_context(|| format!("reading {}", root.display()))?;
        if entry.file_name() == RECOVERY_DIR {
            continue;
        }
        let path = entry.path();
        let file_type = entry
            .file_type()
            .io_context(|| format!("inspecting {}", path.display()))?;
        let removed = if file_type.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.io_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

/// The replaced file's blocks count as free. An unknown free-space figure
/// lets the copy go ahead.
fn check_space(
    partition: &Partition,
    target: &Path,
    artifact: &Path,
    artifact_len: u64,
    available: io::Result<u64>,
) -> Result<()> {
    let existing = fs::symlink_metadata(target).map(|m| m.len()).unwrap_or(0);
    match available {
        Ok(available) if available.saturating_add(existing) < artifact_len => {
            Err(Error::InsufficientSpace {
                partition: partition.device.clone(),
                artifact: artifact.to_path_buf(),
                needed: artifact_len,
                available: available.saturating_add(existing),
            })
        }
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::warn!(
                "cannot determine free space on {}, copying anyway: {e}",
                partition.device.display()
            );
            Ok(())
        }
    }
}

fn copy_durable(from: &Path, to: &Path) -> Result<()> {
    let copy_err = |e: io::Error| Error::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        cause: e.to_string(),
    };
    fs::copy(from, to).map_err(copy_err)?;
    OpenOptions::new()
        .write(true)
        .open(to)
        .and_then(|f| f.sync_all())
        .map_err(copy_err)
}
