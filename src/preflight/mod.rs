//! Preflight checks run before touching an image.
//!
//! Validates that the host has the tools a run needs and that the process
//! may create loop devices and mounts. This prevents a run from failing
//! half way with a cryptic "command not found".
//!
//! # Example
//!
//! ```rust
//! use superimage::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("mksquashfs") {
//!     println!("squashfs-tools not installed");
//! }
//!
//! let tools = &[("rsync", "rsync"), ("file", "file")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{Error, Result};
use crate::process;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Host tools an extraction needs.
///
/// Each tuple is (command_name, package_name).
pub const EXTRACT_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("file", "file"),
    ("unsquashfs", "squashfs-tools"),
    ("rsync", "rsync"),
];

/// Host tools a repack needs.
pub const REPACK_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("file", "file"),
    ("mksquashfs", "squashfs-tools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("rsync", "rsync"),
    ("du", "coreutils"),
    ("cp", "coreutils"),
];

/// Check that specific tools are available.
///
/// Returns [`Error::MissingTools`] listing every missing tool with the
/// package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(Error::MissingTools(msg));
    }

    Ok(())
}

/// Loop devices and mounts need root.
pub fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(Error::Privilege(
            "loop devices and mounts require root; re-run with sudo".to_string(),
        ));
    }
    Ok(())
}
