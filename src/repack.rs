//! Repacking a superimage from a system tree.
//!
//! The base image is copied to the output path first, so the partition
//! table and the EFI/boot partitions come through verbatim. Only the copy
//! is attached and written.
//!
//! ```text
//! CopyBase → Attach → Resolve root → Replace root
//!          → (Resolve var → Replace var)?
//!          → (Resolve home → Replace home)?
//!          → Sync → Release
//! ```
//!
//! A direct filesystem is wiped and refilled. A nested root image keeps its
//! format: squashfs stays squashfs, anything else becomes ext4. Nested var
//! and home images are always rebuilt as ext4 under the existing file name.

use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::{build_ext_image, build_squashfs, SquashfsOptions};
use crate::config::RepackOptions;
use crate::error::{Error, Result};
use crate::host::HostTools;
use crate::layout::{classify, PartitionRole, PartitionShape};
use crate::lock::ImageLock;
use crate::progress::{AbortSignal, Phase, Reporter};
use crate::replace::{install_nested, wipe_and_fill_direct};
use crate::session::{Partition, Session};

/// Inputs of a repack run.
#[derive(Debug, Clone)]
pub struct RepackRequest {
    /// Existing superimage providing the partition table and boot partitions.
    pub base_image: PathBuf,
    /// Full system tree; `var/` and `home/` feed the var and home partitions.
    pub source_tree: PathBuf,
    /// Where the new image is written. Must differ from `base_image`.
    pub output_image: PathBuf,
}

/// What a finished repack did to each partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepackReport {
    pub replaced: Vec<(PartitionRole, PartitionShape)>,
    pub skipped: Vec<PartitionRole>,
}

pub struct Repacker<'a> {
    host: &'a dyn HostTools,
    reporter: &'a dyn Reporter,
    options: RepackOptions,
    squashfs: SquashfsOptions,
    work_parent: Option<PathBuf>,
    abort: AbortSignal,
}

impl<'a> Repacker<'a> {
    pub fn new(host: &'a dyn HostTools, reporter: &'a dyn Reporter) -> Self {
        Self {
            host,
            reporter,
            options: RepackOptions::default(),
            squashfs: SquashfsOptions::default(),
            work_parent: None,
            abort: AbortSignal::new(),
        }
    }

    pub fn options(mut self, options: RepackOptions) -> Self {
        self.options = options;
        self
    }

    pub fn squashfs(mut self, options: SquashfsOptions) -> Self {
        self.squashfs = options;
        self
    }

    /// Parent directory for the run's work directory.
    pub fn work_parent(mut self, dir: Option<PathBuf>) -> Self {
        self.work_parent = dir;
        self
    }

    pub fn abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn run(&self, request: &RepackRequest) -> Result<RepackReport> {
        validate(request)?;

        self.enter(Phase::CopyBase, 2)?;
        let _lock = ImageLock::acquire(&request.output_image).map_err(|e| e.at(Phase::CopyBase))?;
        self.reporter.log(&format!(
            "copying base image {} to {}",
            request.base_image.display(),
            request.output_image.display()
        ));
        self.host
            .copy_image(&request.base_image, &request.output_image)
            .map_err(|e| e.at(Phase::CopyBase))?;

        self.enter(Phase::Attach, 5)?;
        let mut session = Session::new(self.host, self.work_parent.as_deref())
            .map_err(|e| e.at(Phase::Attach))?;
        let attached = session
            .attach(&request.output_image)
            .map_err(|e| e.at(Phase::Attach))?;

        let mut report = RepackReport::default();
        for (role, percent) in [
            (PartitionRole::Root, 15),
            (PartitionRole::Var, 55),
            (PartitionRole::Home, 75),
        ] {
            let Some(source) = self.source_for(role, &request.source_tree) else {
                report.skipped.push(role);
                continue;
            };

            self.enter(Phase::Resolve(role), percent)?;
            let partition = attached.partition(role);
            let shape = classify(&mut session, &partition, role.preferred_names())
                .map_err(|e| e.at(Phase::Resolve(role)))?;

            self.enter(Phase::Replace(role), percent)?;
            self.replace(&mut session, &partition, &shape, &source)
                .map_err(|e| e.at(Phase::Replace(role)))?;
            report.replaced.push((role, shape));
        }

        self.enter(Phase::Sync, 95)?;
        self.host.sync();

        self.reporter.log(&Phase::Release.to_string());
        session.release();
        self.reporter.progress(100);
        self.reporter
            .log(&format!("repacked image written to {}", request.output_image.display()));
        Ok(report)
    }

    /// Check the abort flag, then announce `phase`.
    fn enter(&self, phase: Phase, percent: u8) -> Result<()> {
        if self.abort.is_triggered() {
            self.reporter.warn(&format!("aborted before {phase}"));
            return Err(Error::Aborted(phase));
        }
        self.reporter.progress(percent);
        self.reporter.log(&phase.to_string());
        Ok(())
    }

    /// Source directory for `role`, or `None` if the partition is left alone.
    fn source_for(&self, role: PartitionRole, tree: &Path) -> Option<PathBuf> {
        let enabled = match role {
            PartitionRole::Root => true,
            PartitionRole::Var => self.options.include_var,
            PartitionRole::Home => self.options.include_home,
        };
        if !enabled {
            self.reporter
                .log(&format!("skipping {role} partition (disabled)"));
            return None;
        }

        let dir = match role.subdir() {
            Some(sub) => tree.join(sub),
            None => tree.to_path_buf(),
        };
        if !dir.is_dir() {
            self.reporter.warn(&format!(
                "{} not found in source tree; leaving the {role} partition unchanged",
                dir.display()
            ));
            return None;
        }
        Some(dir)
    }

    fn replace(
        &self,
        session: &mut Session<'_>,
        partition: &Partition,
        shape: &PartitionShape,
        source: &Path,
    ) -> Result<()> {
        let role = partition.role;
        let (name, build_dir) = match shape {
            PartitionShape::DirectFilesystem => {
                self.reporter.log(&format!(
                    "{role} partition is a direct filesystem; replacing its contents"
                ));
                return wipe_and_fill_direct(session, partition, source);
            }
            PartitionShape::NestedSquashfs(name) | PartitionShape::NestedExtImage(name) => {
                (name, session.scratch_dir(&format!("build-{role}"))?)
            }
        };

        let file_name = name.file_name().unwrap_or(name.as_os_str());
        let artifact = build_dir.join(file_name);
        if role == PartitionRole::Root && matches!(shape, PartitionShape::NestedSquashfs(_)) {
            self.reporter
                .log(&format!("rebuilding {role} as squashfs {}", name.display()));
            build_squashfs(session.host(), source, &artifact, &self.squashfs)?;
        } else {
            self.reporter
                .log(&format!("rebuilding {role} as ext4 image {}", name.display()));
            build_ext_image(session, source, &artifact, role.label())?;
        }

        install_nested(session, partition, &artifact)?;
        let _ = fs::remove_file(&artifact);
        Ok(())
    }
}

fn validate(request: &RepackRequest) -> Result<()> {
    if !request.base_image.is_file() {
        return Err(Error::MissingInput {
            what: "base image",
            path: request.base_image.clone(),
        });
    }
    if !request.source_tree.is_dir() {
        return Err(Error::MissingInput {
            what: "source tree",
            path: request.source_tree.clone(),
        });
    }
    if same_file(&request.base_image, &request.output_image) {
        return Err(Error::InvalidInput(format!(
            "output {} would overwrite the base image",
            request.output_image.display()
        )));
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
