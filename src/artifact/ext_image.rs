//! ext4 image builder.
//!
//! Sizes an image from the source tree, formats it, loop-mounts it and
//! copies the tree in with ownership, ACLs, xattrs and hard links intact.
//!
//! # Sizing
//!
//! ```text
//! size = data + data/6 + 64MiB     (~17% slack + inode/journal pad)
//! size = max(size, 256MiB)
//! size = round_up(size, 64MiB)
//! ```
//!
//! The slack absorbs metadata overhead in a single pass, and the 64MiB
//! granularity keeps mkfs away from off-by-one-block geometry failures.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::filesystem::{atomic_move, remove_if_exists, temp_sibling};
use crate::error::{Error, IoContext, Result};
use crate::host::MountOptions;
use crate::session::Session;

const MIB: u64 = 1024 * 1024;

/// Fixed pad added on top of the proportional slack.
pub const EXT_PAD_BYTES: u64 = 64 * MIB;

/// Smallest image ever produced.
pub const EXT_MIN_BYTES: u64 = 256 * MIB;

/// Image sizes are multiples of this.
pub const EXT_ALIGN_BYTES: u64 = 64 * MIB;

/// Image size in bytes for a tree holding `data_bytes` of data.
pub fn ext_image_size(data_bytes: u64) -> u64 {
    let size = data_bytes
        .saturating_add(data_bytes / 6)
        .saturating_add(EXT_PAD_BYTES)
        .max(EXT_MIN_BYTES);
    round_up(size, EXT_ALIGN_BYTES)
}

/// Rounds up to a multiple of `block`; at the top of the range it rounds
/// down to the last multiple instead.
fn round_up(n: u64, block: u64) -> u64 {
    match n % block {
        0 => n,
        rem => n.checked_add(block - rem).unwrap_or(n - rem),
    }
}

/// Build an ext4 image at `output` populated from `source_dir`.
///
/// The image is assembled as `<output>.tmp` and renamed into place once the
/// copy finished and the image was unmounted. Any failure removes the
/// temporary file and leaves `output` untouched.
pub fn build_ext_image(
    session: &mut Session<'_>,
    source_dir: &Path,
    output: &Path,
    label: &str,
) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(Error::MissingInput {
            what: "ext4 source directory",
            path: source_dir.to_path_buf(),
        });
    }

    let data_bytes = session.host().disk_usage(source_dir)?;
    let size = ext_image_size(data_bytes);

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .io_context(|| format!("creating output directory {}", parent.display()))?;
    }

    let tmp = temp_sibling(output);
    remove_if_exists(&tmp)?;

    tracing::info!(
        "mkfs.ext4 {} size={}MiB label={label}",
        output.display(),
        size / MIB
    );

    let built = (|| -> Result<()> {
        allocate_sparse(&tmp, size)?;
        session.host().make_ext4(&tmp, label)?;
        session.with_mount(
            &tmp,
            "ext-image",
            MountOptions::writable().via_loop().fstype("ext4"),
            |session, root| session.host().copy_tree(source_dir, root),
        )
    })();

    if let Err(e) = built {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    atomic_move(&tmp, output)?;
    Ok(output.to_path_buf())
}

fn allocate_sparse(path: &Path, size: u64) -> Result<()> {
    let file = File::create(path).io_context(|| format!("creating {}", path.display()))?;
    file.set_len(size)
        .io_context(|| format!("allocating {} bytes for {}", size, path.display()))
}
