//! The seam between the engine and the host's block-device and filesystem
//! tools.
//!
//! Everything that needs root or a kernel feature (loop devices, mounts,
//! mkfs, rsync) is reached through [`HostTools`]. [`SystemTools`] runs the
//! real utilities; tests substitute an implementation that works on plain
//! directories.

use std::path::{Path, PathBuf};

use crate::artifact::filesystem::dir_size;
use crate::artifact::squashfs::SquashfsOptions;
use crate::error::{Error, Result};
use crate::process::{CommandFailure, Cmd};

#[cfg(test)]
pub(crate) mod fake;

/// How a source is mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    /// Mount a regular file through an automatically allocated loop device.
    pub via_loop: bool,
    /// Filesystem type; `None` lets `mount` detect it.
    pub fstype: Option<String>,
}

impl MountOptions {
    pub fn readonly() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    pub fn writable() -> Self {
        Self::default()
    }

    pub fn via_loop(mut self) -> Self {
        self.via_loop = true;
        self
    }

    pub fn fstype(mut self, fstype: &str) -> Self {
        self.fstype = Some(fstype.to_string());
        self
    }

    /// The `-o` argument for mount(8).
    pub fn option_string(&self) -> String {
        let mut opts = String::from(if self.read_only { "ro" } else { "rw" });
        if self.via_loop {
            opts.push_str(",loop");
        }
        opts
    }
}

/// External collaborators required by the engine.
pub trait HostTools {
    /// Bind `image` to a free loop device with partition scanning and return
    /// the device path.
    fn loop_attach(&self, image: &Path) -> Result<PathBuf>;

    fn loop_detach(&self, device: &Path) -> Result<()>;

    /// Device node of partition `index` on an attached loop device.
    fn partition_path(&self, device: &Path, index: u32) -> PathBuf {
        let mut path = device.as_os_str().to_os_string();
        path.push(format!("p{index}"));
        PathBuf::from(path)
    }

    fn mount(&self, device: &Path, target: &Path, options: &MountOptions) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Content-type label of a file, as reported by a signature sniffer.
    fn probe(&self, path: &Path) -> Result<String>;

    fn make_squashfs(&self, source: &Path, output: &Path, options: &SquashfsOptions)
        -> Result<()>;

    /// Unpack a squashfs image into `dest`, overwriting existing files.
    fn unsquash(&self, image: &Path, dest: &Path) -> Result<()>;

    /// Format `image` as ext4 with no reserved blocks.
    fn make_ext4(&self, image: &Path, label: &str) -> Result<()>;

    /// Copy the contents of `source` into `dest`, preserving ownership
    /// (numeric ids), permissions, ACLs, xattrs, hard links and special files.
    fn copy_tree(&self, source: &Path, dest: &Path) -> Result<()>;

    /// Apparent byte size of a directory tree.
    fn disk_usage(&self, path: &Path) -> Result<u64>;

    /// Copy a whole disk image, keeping holes.
    fn copy_image(&self, source: &Path, dest: &Path) -> Result<()>;

    /// Flush all pending writes.
    fn sync(&self);
}

/// [`HostTools`] backed by util-linux, e2fsprogs, squashfs-tools and rsync.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTools;

fn tool_error(failure: CommandFailure) -> Error {
    Error::Tool {
        tool: failure.program.clone(),
        cause: failure.to_string(),
    }
}

impl HostTools for SystemTools {
    fn loop_attach(&self, image: &Path) -> Result<PathBuf> {
        let result = Cmd::new("losetup")
            .args(["--find", "--show", "-P"])
            .arg_path(image)
            .run()
            .map_err(|failure| Error::Attach {
                image: image.to_path_buf(),
                cause: failure.to_string(),
            })?;

        let device = result.stdout.trim();
        if device.is_empty() {
            return Err(Error::Attach {
                image: image.to_path_buf(),
                cause: "losetup reported no device".to_string(),
            });
        }

        // Partition nodes appear asynchronously.
        match Cmd::new("udevadm").arg("settle").allow_fail().run() {
            Ok(settled) if !settled.success() => {
                tracing::debug!("udevadm settle: {}", settled.stderr.trim());
            }
            Err(e) => tracing::debug!("udevadm settle: {e}"),
            Ok(_) => {}
        }

        Ok(PathBuf::from(device))
    }

    fn loop_detach(&self, device: &Path) -> Result<()> {
        Cmd::new("losetup")
            .arg("-d")
            .arg_path(device)
            .error_msg(&format!("detaching {}", device.display()))
            .run()
            .map(|_| ())
            .map_err(tool_error)
    }

    fn mount(&self, device: &Path, target: &Path, options: &MountOptions) -> Result<()> {
        let mut cmd = Cmd::new("mount").args(["-o", options.option_string().as_str()]);
        if let Some(fstype) = &options.fstype {
            cmd = cmd.args(["-t", fstype.as_str()]);
        }
        cmd.arg_path(device)
            .arg_path(target)
            .run()
            .map(|_| ())
            .map_err(|failure| Error::Mount {
                device: device.to_path_buf(),
                target: target.to_path_buf(),
                cause: failure.to_string(),
            })
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg_path(target)
            .error_msg(&format!("unmounting {}", target.display()))
            .run()
            .map(|_| ())
            .map_err(tool_error)
    }

    fn probe(&self, path: &Path) -> Result<String> {
        let result = Cmd::new("file")
            .arg("-b")
            .arg_path(path)
            .run()
            .map_err(tool_error)?;
        Ok(result.stdout.trim().to_string())
    }

    fn make_squashfs(
        &self,
        source: &Path,
        output: &Path,
        options: &SquashfsOptions,
    ) -> Result<()> {
        let mut cmd = Cmd::new("mksquashfs")
            .arg_path(source)
            .arg_path(output)
            .args(["-comp", options.compression.as_str()]);
        if let Some(block_size) = &options.block_size {
            cmd = cmd.args(["-b", block_size.as_str()]);
        }
        if !options.xattrs {
            cmd = cmd.arg("-no-xattrs");
        }
        cmd.arg("-noappend")
            .arg("-no-progress")
            .run()
            .map(|_| ())
            .map_err(|failure| Error::Build {
                output: output.to_path_buf(),
                cause: failure.to_string(),
            })
    }

    fn unsquash(&self, image: &Path, dest: &Path) -> Result<()> {
        Cmd::new("unsquashfs")
            .args(["-f", "-d"])
            .arg_path(dest)
            .arg_path(image)
            .run()
            .map(|_| ())
            .map_err(|failure| Error::Copy {
                from: image.to_path_buf(),
                to: dest.to_path_buf(),
                cause: failure.to_string(),
            })
    }

    fn make_ext4(&self, image: &Path, label: &str) -> Result<()> {
        let mut cmd = Cmd::new("mkfs.ext4")
            .args(["-F", "-q", "-m", "0"])
            .args(["-E", "lazy_itable_init=0,lazy_journal_init=0"]);
        if !label.is_empty() {
            cmd = cmd.args(["-L", label]);
        }
        cmd.arg_path(image)
            .run()
            .map(|_| ())
            .map_err(|failure| Error::Build {
                output: image.to_path_buf(),
                cause: failure.to_string(),
            })
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> Result<()> {
        Cmd::new("rsync")
            .args(["-aAXH", "--numeric-ids"])
            .arg_dir_contents(source)
            .arg_dir_contents(dest)
            .run()
            .map(|_| ())
            .map_err(|failure| Error::Copy {
                from: source.to_path_buf(),
                to: dest.to_path_buf(),
                cause: failure.to_string(),
            })
    }

    fn disk_usage(&self, path: &Path) -> Result<u64> {
        let du = Cmd::new("du").arg("-sb").arg_path(path).run();
        let parsed = du
            .as_ref()
            .ok()
            .and_then(|r| r.stdout.split_whitespace().next())
            .and_then(|n| n.parse::<u64>().ok());
        match parsed {
            Some(bytes) => Ok(bytes),
            None => {
                if let Err(e) = du {
                    tracing::warn!("du failed, walking {} instead: {e}", path.display());
                }
                dir_size(path)
            }
        }
    }

    fn copy_image(&self, source: &Path, dest: &Path) -> Result<()> {
        Cmd::new("cp")
            .args(["--sparse=always", "--preserve=mode,timestamps"])
            .arg_path(source)
            .arg_path(dest)
            .run()
            .map(|_| ())
            .map_err(|failure| Error::Copy {
                from: source.to_path_buf(),
                to: dest.to_path_buf(),
                cause: failure.to_string(),
            })
    }

    fn sync(&self) {
        // SAFETY: sync(2) takes no arguments and cannot fail.
        unsafe { libc::sync() };
    }
}
