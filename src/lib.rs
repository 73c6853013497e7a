//! Extract and repack the root, var and home filesystems of SteamOS-style
//! multi-partition disk images ("superimages").
//!
//! Each logical filesystem lives on its own partition, either directly or
//! as a squashfs or ext4 image file stored on it. The crate detects which
//! shape a partition has before acting, then performs the inverse
//! operations: image to directory tree ([`Extractor`]) and directory tree to
//! image ([`Repacker`]). EFI and boot partitions are never opened.
//!
//! # Architecture
//!
//! ```text
//! Repacker / Extractor           phase sequencing, progress, abort
//!     │
//!     ├── layout                 which shape does a partition have?
//!     ├── artifact               build squashfs / ext4 images atomically
//!     ├── replace                install nested image or refill partition
//!     └── session                loop device + mounts + work dir (RAII)
//!             │
//!             └── host::HostTools    losetup, mount, mkfs, rsync, ...
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use superimage::{RepackRequest, Repacker, SystemTools, TracingReporter};
//!
//! let report = Repacker::new(&SystemTools, &TracingReporter).run(&RepackRequest {
//!     base_image: "steamdeck.img".into(),
//!     source_tree: "/mnt/steamOS".into(),
//!     output_image: "new.img".into(),
//! })?;
//! ```

pub mod artifact;
pub mod config;
pub mod error;
pub mod extract;
pub mod host;
pub mod layout;
pub mod lock;
pub mod preflight;
pub mod process;
pub mod progress;
pub mod repack;
pub mod replace;
pub mod session;

pub use config::{Config, ExtractOptions, RepackOptions};
pub use error::{Error, Result};
pub use extract::{ExtractReport, ExtractRequest, Extractor};
pub use host::{HostTools, MountOptions, SystemTools};
pub use layout::{PartitionRole, PartitionShape};
pub use progress::{AbortSignal, Phase, Reporter, TracingReporter};
pub use repack::{RepackReport, RepackRequest, Repacker};
pub use session::Session;
