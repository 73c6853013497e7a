//! Extracting the system tree of a superimage into a directory.
//!
//! Root lands at the top of the output directory, var and home in its
//! `var/` and `home/` subdirectories. The image is only ever mounted
//! read-only.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ExtractOptions;
use crate::error::{Error, IoContext, Result};
use crate::host::{HostTools, MountOptions};
use crate::layout::{classify_mounted, PartitionRole, PartitionShape};
use crate::lock::ImageLock;
use crate::progress::{AbortSignal, Phase, Reporter};
use crate::session::{Partition, Session};

/// Inputs of an extract run.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub image: PathBuf,
    /// Created if missing; existing files are overwritten, others kept.
    pub output_dir: PathBuf,
}

/// Shape found on each extracted partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub extracted: Vec<(PartitionRole, PartitionShape)>,
    pub skipped: Vec<PartitionRole>,
}

pub struct Extractor<'a> {
    host: &'a dyn HostTools,
    reporter: &'a dyn Reporter,
    options: ExtractOptions,
    work_parent: Option<PathBuf>,
    abort: AbortSignal,
}

impl<'a> Extractor<'a> {
    pub fn new(host: &'a dyn HostTools, reporter: &'a dyn Reporter) -> Self {
        Self {
            host,
            reporter,
            options: ExtractOptions::default(),
            work_parent: None,
            abort: AbortSignal::new(),
        }
    }

    pub fn options(mut self, options: ExtractOptions) -> Self {
        self.options = options;
        self
    }

    pub fn work_parent(mut self, dir: Option<PathBuf>) -> Self {
        self.work_parent = dir;
        self
    }

    pub fn abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn run(&self, request: &ExtractRequest) -> Result<ExtractReport> {
        if !request.image.is_file() {
            return Err(Error::MissingInput {
                what: "image",
                path: request.image.clone(),
            });
        }
        if request.output_dir.exists() && !request.output_dir.is_dir() {
            return Err(Error::InvalidInput(format!(
                "output {} exists and is not a directory",
                request.output_dir.display()
            )));
        }

        self.enter(Phase::Attach, 0)?;
        let _lock =
            ImageLock::acquire_if_writable(&request.image).map_err(|e| e.at(Phase::Attach))?;
        fs::create_dir_all(&request.output_dir)
            .io_context(|| format!("creating {}", request.output_dir.display()))
            .map_err(|e| e.at(Phase::Attach))?;
        let mut session = Session::new(self.host, self.work_parent.as_deref())
            .map_err(|e| e.at(Phase::Attach))?;
        let attached = session
            .attach(&request.image)
            .map_err(|e| e.at(Phase::Attach))?;

        let mut report = ExtractReport::default();
        for (role, percent) in [
            (PartitionRole::Root, 10),
            (PartitionRole::Var, 55),
            (PartitionRole::Home, 80),
        ] {
            let enabled = match role {
                PartitionRole::Root => true,
                PartitionRole::Var => self.options.include_var,
                PartitionRole::Home => self.options.include_home,
            };
            if !enabled {
                self.reporter
                    .log(&format!("skipping {role} partition (disabled)"));
                report.skipped.push(role);
                continue;
            }

            self.enter(Phase::Extract(role), percent)?;
            let dest = match role.subdir() {
                Some(sub) => request.output_dir.join(sub),
                None => request.output_dir.clone(),
            };
            let shape = self
                .extract_partition(&mut session, &attached.partition(role), &dest)
                .map_err(|e| e.at(Phase::Extract(role)))?;
            report.extracted.push((role, shape));
        }

        self.reporter.log(&Phase::Release.to_string());
        session.release();
        self.reporter.progress(100);
        self.reporter.log(&format!(
            "files extracted into {}",
            request.output_dir.display()
        ));
        Ok(report)
    }

    fn enter(&self, phase: Phase, percent: u8) -> Result<()> {
        if self.abort.is_triggered() {
            self.reporter.warn(&format!("aborted before {phase}"));
            return Err(Error::Aborted(phase));
        }
        self.reporter.progress(percent);
        self.reporter.log(&phase.to_string());
        Ok(())
    }

    fn extract_partition(
        &self,
        session: &mut Session<'_>,
        partition: &Partition,
        dest: &Path,
    ) -> Result<PartitionShape> {
        let role = partition.role;
        let reporter = self.reporter;
        let name = format!("part-{role}");

        session.with_mount(
            &partition.device,
            &name,
            MountOptions::readonly(),
            |session, root| {
                let shape = classify_mounted(session.host(), root, role.preferred_names())?;
                fs::create_dir_all(dest)
                    .io_context(|| format!("creating {}", dest.display()))?;

                match &shape {
                    PartitionShape::NestedSquashfs(inner) => {
                        reporter.log(&format!(
                            "unsquashing {} into {}",
                            inner.display(),
                            dest.display()
                        ));
                        session.host().unsquash(&root.join(inner), dest)?;
                    }
                    PartitionShape::NestedExtImage(inner) => {
                        reporter.log(&format!(
                            "copying ext image {} into {}",
                            inner.display(),
                            dest.display()
                        ));
                        session.with_mount(
                            &root.join(inner),
                            &format!("inner-{role}"),
                            MountOptions::readonly().via_loop(),
                            |session, inner_root| session.host().copy_tree(inner_root, dest),
                        )?;
                    }
                    PartitionShape::DirectFilesystem => {
                        reporter.log(&format!(
                            "no nested image on the {role} partition; copying its contents"
                        ));
                        session.host().copy_tree(root, dest)?;
                    }
                }
                Ok(shape)
            },
        )
    }
}
