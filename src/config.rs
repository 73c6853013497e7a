//! Configuration file support.
//!
//! ```toml
//! work_dir = "/var/tmp"
//!
//! [repack]
//! include_var = true
//! include_home = false
//!
//! [extract]
//! include_home = false
//!
//! [squashfs]
//! compression = "zstd"
//! block_size = "1M"
//! xattrs = true
//! ```
//!
//! Every key is optional. Unknown keys are rejected so typos surface.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::artifact::squashfs::SquashfsOptions;
use crate::error::{Error, Result};

/// Which optional partitions a repack rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepackOptions {
    pub include_var: bool,
    pub include_home: bool,
}

impl Default for RepackOptions {
    fn default() -> Self {
        Self {
            include_var: true,
            include_home: true,
        }
    }
}

/// Which optional partitions an extraction reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractOptions {
    pub include_var: bool,
    pub include_home: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            include_var: true,
            include_home: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Parent of per-run work directories; the system temp dir if unset.
    pub work_dir: Option<PathBuf>,
    pub repack: RepackOptions,
    pub extract: ExtractOptions,
    pub squashfs: SquashfsOptions,
}

impl Config {
    /// Location of the per-user config file, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("superimage").join("config.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one the per-user file is used if
    /// present, and built-in defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(Error::MissingInput {
                    what: "config file",
                    path: path.to_path_buf(),
                });
            }
            return Self::from_file(path);
        }

        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        let config = Self::parse(&text).map_err(|cause| Error::Config {
            path: path.to_path_buf(),
            cause,
        })?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }
}
