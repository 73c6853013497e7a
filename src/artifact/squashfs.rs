//! Squashfs image builder.
//!
//! Provides a wrapper around `mksquashfs` for rebuilding a nested root
//! image when the partition already carried a squashfs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::filesystem::{atomic_move, remove_if_exists, temp_sibling};
use crate::error::{Error, IoContext, Result};
use crate::host::HostTools;

/// Options for building a squashfs image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SquashfsOptions {
    /// Compression algorithm (gzip, xz, zstd, lzo, lz4).
    ///
    /// Default: "xz" (what stock SteamOS recovery images ship)
    pub compression: String,

    /// Block size (e.g., "128K", "1M"); `None` keeps the mksquashfs default.
    pub block_size: Option<String>,

    /// Whether to include extended attributes.
    ///
    /// Default: true (root trees carry security.capability and SELinux labels)
    pub xattrs: bool,
}

impl Default for SquashfsOptions {
    fn default() -> Self {
        Self {
            compression: "xz".to_string(),
            block_size: None,
            xattrs: true,
        }
    }
}

/// Build a squashfs image from a directory.
///
/// The image is written to `<output>.tmp` and renamed to `output` only
/// after the packer succeeded. On failure the temporary file is removed and
/// `output` is left as it was.
///
/// # Example
///
/// ```rust,ignore
/// use superimage::artifact::squashfs::{build_squashfs, SquashfsOptions};
/// use superimage::host::SystemTools;
/// use std::path::Path;
///
/// build_squashfs(
///     &SystemTools,
///     Path::new("/mnt/steamOS"),
///     Path::new("/tmp/build/rootfs.squashfs"),
///     &SquashfsOptions::default(),
/// )?;
/// ```
pub fn build_squashfs(
    host: &dyn HostTools,
    source_dir: &Path,
    output: &Path,
    options: &SquashfsOptions,
) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(Error::MissingInput {
            what: "squashfs source directory",
            path: source_dir.to_path_buf(),
        });
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .io_context(|| format!("creating output directory {}", parent.display()))?;
    }

    let tmp = temp_sibling(output);
    remove_if_exists(&tmp)?;

    tracing::info!(
        "mksquashfs {} -> {} ({} compression)",
        source_dir.display(),
        output.display(),
        options.compression
    );

    if let Err(e) = host.make_squashfs(source_dir, &tmp, options) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    atomic_move(&tmp, output)?;

    if let Ok(meta) = fs::metadata(output) {
        tracing::info!("squashfs created: {} MiB", meta.len() / 1024 / 1024);
    }
    Ok(output.to_path_buf())
}
