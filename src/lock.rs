//! Advisory per-image locking.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, IoContext, Result};

/// RAII guard: holds an exclusive lock on `<image>.lock`, unlocks and
/// removes the lock file on drop.
#[derive(Debug)]
pub struct ImageLock {
    _file: File,
    path: PathBuf,
}

impl ImageLock {
    /// Lock `image` for the duration of a run.
    ///
    /// Fails with [`Error::Locked`] instead of waiting if another run holds it.
    pub fn acquire(image: &Path) -> Result<Self> {
        let path = lock_path(image);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("creating {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .io_context(|| format!("creating lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::Locked {
                path: image.to_path_buf(),
            });
        }
        tracing::debug!("locked {}", path.display());

        Ok(Self { _file: file, path })
    }

    /// Like [`acquire`](Self::acquire), but an image on read-only media is
    /// not locked at all.
    pub fn acquire_if_writable(image: &Path) -> Result<Option<Self>> {
        match Self::acquire(image) {
            Ok(lock) => Ok(Some(lock)),
            Err(Error::Io { source, .. }) if read_only_location(&source) => {
                tracing::debug!(
                    "{} is on read-only media; not locking it ({source})",
                    image.display()
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ImageLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_only_location(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::PermissionDenied || e.raw_os_error() == Some(libc::EROFS)
}

fn lock_path(image: &Path) -> PathBuf {
    let mut name = image
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("image"));
    name.push(".lock");
    image.with_file_name(name)
}
