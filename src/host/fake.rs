//! A [`HostTools`] that works on plain directories.
//!
//! Disk and nested images are small marker files whose first line names a
//! backing directory under `<root>/store`. Mounting replaces the mount point
//! with a symlink to that directory, so engine code sees an ordinary tree.
//!
//! | File header       | Backing directory           | Probe label |
//! |-------------------|-----------------------------|-------------|
//! | `FAKEDISK <id>`   | `store/<id>/p1` .. `p5`     | DOS/MBR     |
//! | `FAKEEXT4 <id>`   | `store/<id>`                | ext4        |
//! | `hsqs <id>`       | `store/<id>`                | Squashfs    |

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use super::{HostTools, MountOptions};
use crate::artifact::filesystem::dir_size;
use crate::artifact::squashfs::SquashfsOptions;
use crate::error::{Error, Result};

const DISK: &str = "FAKEDISK";
const EXT4: &str = "FAKEEXT4";
const SQUASHFS: &str = "hsqs";

#[derive(Default)]
struct State {
    fail_on: HashSet<String>,
    calls: Vec<String>,
    mounted: Vec<PathBuf>,
    loops: HashMap<PathBuf, String>,
    labels: HashMap<String, String>,
    next_id: usize,
    next_loop: usize,
}

pub(crate) struct FakeHost {
    root: PathBuf,
    state: RefCell<State>,
}

impl FakeHost {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            root: root.join("fakehost"),
            state: RefCell::new(State::default()),
        }
    }

    /// Make every later call to `op` fail.
    pub(crate) fn fail_on(&self, op: &str) {
        self.state.borrow_mut().fail_on.insert(op.to_string());
    }

    /// Every host call so far, as `"<op> <args>"`.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    /// Mount points not yet unmounted.
    pub(crate) fn active_mounts(&self) -> Vec<PathBuf> {
        self.state.borrow().mounted.clone()
    }

    /// Loop devices not yet detached.
    pub(crate) fn attached_loops(&self) -> Vec<PathBuf> {
        self.state.borrow().loops.keys().cloned().collect()
    }

    /// Write an empty five-partition disk image at `path`.
    pub(crate) fn create_disk(&self, path: &Path) -> PathBuf {
        let id = self.new_id();
        for n in 1..=5 {
            fs::create_dir_all(self.store(&id).join(format!("p{n}"))).unwrap();
        }
        fs::write(path, format!("{DISK} {id}\n")).unwrap();
        path.to_path_buf()
    }

    /// Backing directory of partition `index` of a disk image.
    pub(crate) fn partition_dir(&self, disk: &Path, index: u32) -> PathBuf {
        let (kind, id) = read_header(disk).unwrap();
        assert_eq!(kind, DISK, "{} is not a disk image", disk.display());
        self.store(&id).join(format!("p{index}"))
    }

    /// Write a small ext4 image at `path` and return its contents directory.
    pub(crate) fn create_ext_image(&self, path: &Path, label: &str) -> PathBuf {
        let id = self.new_id();
        fs::create_dir_all(self.store(&id)).unwrap();
        fs::write(path, format!("{EXT4} {id}\n")).unwrap();
        self.state
            .borrow_mut()
            .labels
            .insert(id.clone(), label.to_string());
        self.store(&id)
    }

    /// Write a squashfs image at `path` and return its contents directory.
    pub(crate) fn create_squashfs(&self, path: &Path) -> PathBuf {
        let id = self.new_id();
        fs::create_dir_all(self.store(&id)).unwrap();
        fs::write(path, format!("{SQUASHFS} {id}\n")).unwrap();
        self.store(&id)
    }

    /// Contents directory of a nested ext4 or squashfs image.
    pub(crate) fn image_contents(&self, path: &Path) -> Option<PathBuf> {
        match read_header(path)? {
            (kind, id) if kind == EXT4 || kind == SQUASHFS => Some(self.store(&id)),
            _ => None,
        }
    }

    pub(crate) fn ext_label(&self, path: &Path) -> Option<String> {
        let (kind, id) = read_header(path)?;
        if kind != EXT4 {
            return None;
        }
        self.state.borrow().labels.get(&id).cloned()
    }

    fn new_id(&self) -> String {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        state.next_id.to_string()
    }

    fn store(&self, id: &str) -> PathBuf {
        self.root.join("store").join(id)
    }

    fn record(&self, op: &str, detail: String) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("{op} {detail}"));
        if state.fail_on.contains(op) {
            return Err(Error::Tool {
                tool: op.to_string(),
                cause: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn backing_dir(&self, source: &Path) -> Option<PathBuf> {
        let state = self.state.borrow();
        for (device, id) in &state.loops {
            for n in 1..=5 {
                if self.partition_path(device, n) == source {
                    return Some(self.store(id).join(format!("p{n}")));
                }
            }
        }
        drop(state);
        match read_header(source)? {
            (kind, id) if kind == EXT4 || kind == SQUASHFS => Some(self.store(&id)),
            _ => None,
        }
    }
}

impl HostTools for FakeHost {
    fn loop_attach(&self, image: &Path) -> Result<PathBuf> {
        let attach_err = |cause: &str| Error::Attach {
            image: image.to_path_buf(),
            cause: cause.to_string(),
        };
        self.record("loop_attach", image.display().to_string())
            .map_err(|_| attach_err("no free loop device"))?;

        let id = match read_header(image) {
            Some((kind, id)) if kind == DISK => id,
            _ => return Err(attach_err("not a disk image")),
        };
        let mut state = self.state.borrow_mut();
        let device = self.root.join("dev").join(format!("loop{}", state.next_loop));
        state.next_loop += 1;
        state.loops.insert(device.clone(), id);
        Ok(device)
    }

    fn loop_detach(&self, device: &Path) -> Result<()> {
        self.record("loop_detach", device.display().to_string())?;
        self.state.borrow_mut().loops.remove(device);
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path, options: &MountOptions) -> Result<()> {
        let mount_err = |cause: &str| Error::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            cause: cause.to_string(),
        };
        let mut opts = options.option_string();
        if let Some(fstype) = &options.fstype {
            opts.push_str(" -t ");
            opts.push_str(fstype);
        }
        self.record(
            "mount",
            format!("{opts} {} {}", device.display(), target.display()),
        )
        .map_err(|_| mount_err("mount exited with status 32"))?;

        let backing = self
            .backing_dir(device)
            .ok_or_else(|| mount_err("wrong fs type, bad option, bad superblock"))?;
        fs::remove_dir(target).map_err(|e| mount_err(&e.to_string()))?;
        symlink(&backing, target).map_err(|e| mount_err(&e.to_string()))?;
        self.state.borrow_mut().mounted.push(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.record("umount", target.display().to_string())?;
        let mut state = self.state.borrow_mut();
        let Some(pos) = state.mounted.iter().position(|m| m == target) else {
            return Err(Error::Tool {
                tool: "umount".to_string(),
                cause: format!("{}: not mounted", target.display()),
            });
        };
        state.mounted.remove(pos);
        fs::remove_file(target).map_err(|e| Error::io("removing mount symlink", e))?;
        fs::create_dir(target).map_err(|e| Error::io("recreating mount point", e))?;
        Ok(())
    }

    fn probe(&self, path: &Path) -> Result<String> {
        self.record("probe", path.display().to_string())?;
        let mut head = Vec::new();
        fs::File::open(path)
            .and_then(|f| f.take(64).read_to_end(&mut head))
            .map_err(|e| Error::Tool {
                tool: "file".to_string(),
                cause: e.to_string(),
            })?;
        let label = if head.starts_with(SQUASHFS.as_bytes()) {
            "Squashfs filesystem, little endian, version 4.0, xz compressed".to_string()
        } else if head.starts_with(EXT4.as_bytes()) {
            let label = self.ext_label(path).unwrap_or_default();
            format!("Linux rev 1.0 ext4 filesystem data, volume name \"{label}\" (extents)")
        } else if head.starts_with(DISK.as_bytes()) {
            "DOS/MBR boot sector; partition 1 : ID=0xee".to_string()
        } else {
            "data".to_string()
        };
        Ok(label)
    }

    fn make_squashfs(
        &self,
        source: &Path,
        output: &Path,
        options: &SquashfsOptions,
    ) -> Result<()> {
        let build_err = |cause: String| Error::Build {
            output: output.to_path_buf(),
            cause,
        };
        if let Err(e) = self.record(
            "make_squashfs",
            format!("{} {} {}", source.display(), output.display(), options.compression),
        ) {
            // A packer that dies halfway leaves a truncated file behind.
            let _ = fs::write(output, "hsqs partial");
            return Err(build_err(e.to_string()));
        }
        let id = self.new_id();
        copy_dir_recursive(source, &self.store(&id)).map_err(|e| build_err(e.to_string()))?;
        fs::write(output, format!("{SQUASHFS} {id}\n")).map_err(|e| build_err(e.to_string()))
    }

    fn unsquash(&self, image: &Path, dest: &Path) -> Result<()> {
        let copy_err = |cause: String| Error::Copy {
            from: image.to_path_buf(),
            to: dest.to_path_buf(),
            cause,
        };
        self.record("unsquash", format!("{} {}", image.display(), dest.display()))
            .map_err(|e| copy_err(e.to_string()))?;
        let id = match read_header(image) {
            Some((kind, id)) if kind == SQUASHFS => id,
            _ => return Err(copy_err("not a squashfs image".to_string())),
        };
        copy_dir_recursive(&self.store(&id), dest).map_err(|e| copy_err(e.to_string()))
    }

    fn make_ext4(&self, image: &Path, label: &str) -> Result<()> {
        let build_err = |cause: String| Error::Build {
            output: image.to_path_buf(),
            cause,
        };
        self.record("make_ext4", format!("{} {label}", image.display()))
            .map_err(|e| build_err(e.to_string()))?;
        let id = self.new_id();
        fs::create_dir_all(self.store(&id)).map_err(|e| build_err(e.to_string()))?;
        // Overwrite the head of the file only; the allocated size stays.
        OpenOptions::new()
            .write(true)
            .open(image)
            .and_then(|mut f| f.write_all(format!("{EXT4} {id}\n").as_bytes()))
            .map_err(|e| build_err(e.to_string()))?;
        self.state
            .borrow_mut()
            .labels
            .insert(id, label.to_string());
        Ok(())
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> Result<()> {
        let copy_err = |cause: String| Error::Copy {
            from: source.to_path_buf(),
            to: dest.to_path_buf(),
            cause,
        };
        self.record("copy_tree", format!("{} {}", source.display(), dest.display()))
            .map_err(|e| copy_err(e.to_string()))?;
        copy_dir_recursive(source, dest).map_err(|e| copy_err(e.to_string()))
    }

    fn disk_usage(&self, path: &Path) -> Result<u64> {
        self.record("disk_usage", path.display().to_string())?;
        dir_size(path)
    }

    fn copy_image(&self, source: &Path, dest: &Path) -> Result<()> {
        let copy_err = |cause: String| Error::Copy {
            from: source.to_path_buf(),
            to: dest.to_path_buf(),
            cause,
        };
        self.record("copy_image", format!("{} {}", source.display(), dest.display()))
            .map_err(|e| copy_err(e.to_string()))?;
        match read_header(source) {
            Some((kind, old)) if kind == DISK => {
                let id = self.new_id();
                copy_dir_recursive(&self.store(&old), &self.store(&id))
                    .map_err(|e| copy_err(e.to_string()))?;
                fs::write(dest, format!("{DISK} {id}\n")).map_err(|e| copy_err(e.to_string()))
            }
            _ => fs::copy(source, dest)
                .map(|_| ())
                .map_err(|e| copy_err(e.to_string())),
        }
    }

    fn sync(&self) {
        self.state.borrow_mut().calls.push("sync".to_string());
    }
}

fn read_header(path: &Path) -> Option<(String, String)> {
    let mut head = Vec::new();
    fs::File::open(path)
        .and_then(|f| f.take(64).read_to_end(&mut head))
        .ok()?;
    let line = String::from_utf8_lossy(&head);
    let line = line.lines().next()?;
    let (kind, id) = line.split_once(' ')?;
    Some((kind.to_string(), id.trim().to_string()))
}

/// Merge `src` into `dst`, keeping symlinks as symlinks.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.symlink_metadata().is_ok() {
                fs::remove_file(&dst_path)?;
            }
            symlink(target, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn mount_exposes_partition_contents() {
        let temp = TempDir::new().unwrap();
        let host = FakeHost::new(temp.path());
        let disk = host.create_disk(&temp.path().join("steamdeck.img"));
        fs::write(host.partition_dir(&disk, 3).join("rootfs-A.img"), "x").unwrap();

        let device = host.loop_attach(&disk).unwrap();
        let target = temp.path().join("mnt");
        fs::create_dir(&target).unwrap();
        host.mount(
            &host.partition_path(&device, 3),
            &target,
            &MountOptions::readonly(),
        )
        .unwrap();
        assert!(target.join("rootfs-A.img").is_file());

        host.unmount(&target).unwrap();
        assert!(target.is_dir());
        assert!(fs::read_dir(&target).unwrap().next().is_none());
        host.loop_detach(&device).unwrap();
        assert!(host.attached_loops().is_empty());
    }

    #[test]
    fn copied_disk_is_independent() {
        let temp = TempDir::new().unwrap();
        let host = FakeHost::new(temp.path());
        let base = host.create_disk(&temp.path().join("base.img"));
        fs::write(host.partition_dir(&base, 5).join("home.img"), "old").unwrap();

        let copy = temp.path().join("copy.img");
        host.copy_image(&base, &copy).unwrap();
        fs::write(host.partition_dir(&copy, 5).join("home.img"), "new").unwrap();

        assert_eq!(
            fs::read_to_string(host.partition_dir(&base, 5).join("home.img")).unwrap(),
            "old"
        );
    }
}
