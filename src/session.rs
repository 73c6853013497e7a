//! Kernel resource tracking for a single run.
//!
//! A [`Session`] owns everything a run acquires from the host: the loop
//! device of the attached image, every mount point, and a private work
//! directory. Resources are registered as they are acquired and torn down in
//! reverse when the session is released, which happens on drop at the
//! latest. Teardown is best-effort: a failing step is logged and the
//! remaining steps still run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, IoContext, Result};
use crate::host::{HostTools, MountOptions};
use crate::layout::PartitionRole;

/// A disk image bound to a loop device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedImage {
    pub image: PathBuf,
    pub device: PathBuf,
    /// Indexed by role, in [`PartitionRole::ALL`] order.
    partitions: [Partition; 3],
}

impl AttachedImage {
    /// Handle to the partition holding `role`.
    pub fn partition(&self, role: PartitionRole) -> Partition {
        self.partitions[role as usize].clone()
    }
}

/// One of the root/var/home partitions of an attached image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub role: PartitionRole,
    pub device: PathBuf,
}

/// A live mount registered with a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    source: PathBuf,
    target: PathBuf,
}

impl MountHandle {
    /// The mount point.
    pub fn path(&self) -> &Path {
        &self.target
    }
}

/// Owner of the loop device, mounts and work directory of one run.
pub struct Session<'h> {
    host: &'h dyn HostTools,
    work_dir: PathBuf,
    mounts: Vec<MountHandle>,
    loops: Vec<PathBuf>,
    attached: bool,
    counter: usize,
    released: bool,
}

impl<'h> Session<'h> {
    /// Create a session with a fresh work directory under `work_parent`
    /// (the system temp directory if `None`).
    pub fn new(host: &'h dyn HostTools, work_parent: Option<&Path>) -> Result<Self> {
        let parent = work_parent
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let work_dir = create_work_dir(&parent)?;
        tracing::debug!("work directory {}", work_dir.display());

        Ok(Self {
            host,
            work_dir,
            mounts: Vec::new(),
            loops: Vec::new(),
            attached: false,
            counter: 0,
            released: false,
        })
    }

    pub fn host(&self) -> &'h dyn HostTools {
        self.host
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// A new, empty directory inside the work directory.
    pub fn scratch_dir(&mut self, name: &str) -> Result<PathBuf> {
        self.ensure_live()?;
        let dir = self.next_path(name);
        fs::create_dir_all(&dir).io_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }

    /// Bind `image` to a loop device with partition scanning.
    ///
    /// A session holds at most one attached image.
    pub fn attach(&mut self, image: &Path) -> Result<AttachedImage> {
        self.ensure_live()?;
        if self.attached {
            return Err(Error::InvalidState(format!(
                "cannot attach {}: an image is already attached",
                image.display()
            )));
        }

        let device = self.host.loop_attach(image)?;
        self.loops.push(device.clone());
        self.attached = true;
        tracing::info!("attached {} as {}", image.display(), device.display());

        let partitions = PartitionRole::ALL.map(|role| Partition {
            role,
            device: self.host.partition_path(&device, role.index()),
        });
        Ok(AttachedImage {
            image: image.to_path_buf(),
            device,
            partitions,
        })
    }

    /// Mount `source` on a new directory named after `name`.
    pub fn mount(
        &mut self,
        source: &Path,
        name: &str,
        options: MountOptions,
    ) -> Result<MountHandle> {
        self.ensure_live()?;
        let target = self.next_path(name);
        fs::create_dir_all(&target)
            .io_context(|| format!("creating mount point {}", target.display()))?;

        if let Err(e) = self.host.mount(source, &target, &options) {
            let _ = fs::remove_dir(&target);
            return Err(e);
        }

        let handle = MountHandle {
            source: source.to_path_buf(),
            target,
        };
        self.mounts.push(handle.clone());
        Ok(handle)
    }

    /// Unmount one mount before the session ends.
    ///
    /// On failure the mount stays registered so release retries it.
    pub fn unmount(&mut self, handle: &MountHandle) -> Result<()> {
        let pos = self
            .mounts
            .iter()
            .rposition(|m| m == handle)
            .ok_or_else(|| {
                Error::InvalidState(format!("{} is not mounted", handle.target.display()))
            })?;

        self.host.unmount(&handle.target)?;
        self.mounts.remove(pos);
        let _ = fs::remove_dir(&handle.target);
        Ok(())
    }

    /// Mount `source`, run `f` with the mount point, then unmount.
    ///
    /// An error from `f` takes precedence over an unmount error.
    pub fn with_mount<T, F>(
        &mut self,
        source: &Path,
        name: &str,
        options: MountOptions,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Session<'h>, &Path) -> Result<T>,
    {
        let handle = self.mount(source, name, options)?;
        let result = f(self, handle.path());
        let unmounted = self.unmount(&handle);

        match (result, unmounted) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unmount_err)) => {
                tracing::warn!("{unmount_err}");
                Err(e)
            }
        }
    }

    /// Tear everything down: unmount in reverse order, detach loop devices
    /// in reverse order, remove the work directory.
    ///
    /// Safe to call more than once. If an unmount failed the work directory
    /// is kept, since removing it would descend into the live mount.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut unmount_failed = false;
        while let Some(mount) = self.mounts.pop() {
            match self.host.unmount(&mount.target) {
                Ok(()) => {
                    let _ = fs::remove_dir(&mount.target);
                }
                Err(e) => {
                    unmount_failed = true;
                    tracing::warn!(
                        "failed to unmount {} ({}): {e}",
                        mount.target.display(),
                        mount.source.display()
                    );
                }
            }
        }

        while let Some(device) = self.loops.pop() {
            if let Err(e) = self.host.loop_detach(&device) {
                tracing::warn!("failed to detach {}: {e}", device.display());
            }
        }

        if unmount_failed {
            tracing::warn!(
                "leaving work directory {} in place (mounts still active)",
                self.work_dir.display()
            );
            return;
        }
        match fs::remove_dir_all(&self.work_dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                tracing::warn!("failed to remove {}: {e}", self.work_dir.display());
            }
            _ => {}
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            return Err(Error::InvalidState("session already released".to_string()));
        }
        Ok(())
    }

    fn next_path(&mut self, name: &str) -> PathBuf {
        self.counter += 1;
        self.work_dir.join(format!("{name}-{}", self.counter))
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

fn create_work_dir(parent: &Path) -> Result<PathBuf> {
    fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;

    let mut nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    loop {
        let dir = parent.join(format!("superimage-{}-{nanos}", std::process::id()));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => nanos += 1,
            Err(e) => return Err(Error::io(format!("creating {}", dir.display()), e)),
        }
    }
}
