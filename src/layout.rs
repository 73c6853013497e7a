//! Partition roles and content-shape detection.
//!
//! Image variants store the same logical filesystem differently: as the
//! partition's own filesystem, or as a squashfs or ext4 image file sitting on
//! it. [`classify`] looks at what is actually there before anything touches
//! the partition.
//!
//! Candidate selection, in order:
//!
//! 1. The first of the role's preferred names that exists as a regular file
//!    (symlinks are not followed).
//! 2. Otherwise the largest regular file at the top level. Entries are
//!    visited in name order and the first of equally large files wins.
//! 3. No regular file at all means the partition is a direct filesystem.
//!
//! The candidate's content label then decides between squashfs, ext and
//! direct.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::filesystem::is_regular_file;
use crate::error::{IoContext, Result};
use crate::host::{HostTools, MountOptions};
use crate::session::{Partition, Session};

/// Logical filesystems of a superimage, by fixed partition position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionRole {
    Root,
    Var,
    Home,
}

impl PartitionRole {
    pub const ALL: [PartitionRole; 3] = [
        PartitionRole::Root,
        PartitionRole::Var,
        PartitionRole::Home,
    ];

    /// 1-based partition number. Partitions 1 and 2 (EFI, boot) have no role.
    pub fn index(self) -> u32 {
        match self {
            PartitionRole::Root => 3,
            PartitionRole::Var => 4,
            PartitionRole::Home => 5,
        }
    }

    /// Nested image names to look for, most specific first.
    pub fn preferred_names(self) -> &'static [&'static str] {
        match self {
            PartitionRole::Root => &[
                "rootfs-A.img",
                "rootfs.img",
                "rootfs.squashfs",
                "filesystem.squashfs",
                "arch.squashfs",
            ],
            PartitionRole::Var => &["var-A.img", "var.img"],
            PartitionRole::Home => &["home.img"],
        }
    }

    /// Name used when a nested image has to be created from scratch.
    pub fn default_name(self) -> &'static str {
        self.preferred_names()[0]
    }

    /// ext4 volume label for rebuilt images.
    pub fn label(self) -> &'static str {
        match self {
            PartitionRole::Root => "rootfs-A",
            PartitionRole::Var => "var-A",
            PartitionRole::Home => "home",
        }
    }

    /// Location of this role's tree relative to a full system tree.
    pub fn subdir(self) -> Option<&'static str> {
        match self {
            PartitionRole::Root => None,
            PartitionRole::Var => Some("var"),
            PartitionRole::Home => Some("home"),
        }
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionRole::Root => "root",
            PartitionRole::Var => "var",
            PartitionRole::Home => "home",
        })
    }
}

/// How a logical filesystem is stored on its partition.
///
/// Paths are relative to the partition root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionShape {
    NestedSquashfs(PathBuf),
    NestedExtImage(PathBuf),
    DirectFilesystem,
}

/// Content type of a candidate file, from its probe label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Squashfs,
    Ext,
    Other,
}

impl ContentKind {
    pub fn from_probe(label: &str) -> Self {
        let label = label.to_ascii_lowercase();
        if label.contains("squashfs") {
            ContentKind::Squashfs
        } else if ["ext2", "ext3", "ext4"].iter().any(|ext| label.contains(ext)) {
            ContentKind::Ext
        } else {
            ContentKind::Other
        }
    }
}

/// The file that most plausibly holds the nested image, as a name relative
/// to `root`.
pub fn locate_candidate(root: &Path, preferred: &[&str]) -> Result<Option<PathBuf>> {
    if let Some(name) = preferred.iter().find(|n| is_regular_file(&root.join(n))) {
        return Ok(Some(PathBuf::from(name)));
    }

    let mut entries = fs::read_dir(root)
        .io_context(|| format!("reading {}", root.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .io_context(|| format!("reading {}", root.display()))?;
    entries.sort_by_key(|e| e.file_name());

    let mut largest: Option<(u64, PathBuf)> = None;
    for entry in entries {
        let meta = fs::symlink_metadata(entry.path())
            .io_context(|| format!("inspecting {}", entry.path().display()))?;
        if !meta.file_type().is_file() {
            continue;
        }
        if largest.as_ref().map_or(true, |(size, _)| meta.len() > *size) {
            largest = Some((meta.len(), PathBuf::from(entry.file_name())));
        }
    }
    Ok(largest.map(|(_, name)| name))
}

/// Classify the tree mounted at `root`.
///
/// A probe failure is returned as an error rather than treated as "direct",
/// which would allow a nested image to be wiped.
pub fn classify_mounted(
    host: &dyn HostTools,
    root: &Path,
    preferred: &[&str],
) -> Result<PartitionShape> {
    let Some(candidate) = locate_candidate(root, preferred)? else {
        return Ok(PartitionShape::DirectFilesystem);
    };

    let label = host.probe(&root.join(&candidate))?;
    tracing::debug!("{}: {label}", candidate.display());

    Ok(match ContentKind::from_probe(&label) {
        ContentKind::Squashfs => PartitionShape::NestedSquashfs(candidate),
        ContentKind::Ext => PartitionShape::NestedExtImage(candidate),
        ContentKind::Other => PartitionShape::DirectFilesystem,
    })
}

/// Mount `partition` read-only and classify its content.
pub fn classify(
    session: &mut Session<'_>,
    partition: &Partition,
    preferred: &[&str],
) -> Result<PartitionShape> {
    let name = format!("probe-{}", partition.role);
    let shape = session.with_mount(
        &partition.device,
        &name,
        MountOptions::readonly(),
        |session, root| classify_mounted(session.host(), root, preferred),
    )?;
    tracing::info!("{} partition: {shape:?}", partition.role);
    Ok(shape)
}
