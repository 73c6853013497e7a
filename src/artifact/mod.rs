//! Replacement artifact builders.
//!
//! - [`filesystem`] - Atomic moves, staging names and directory sizing
//! - [`squashfs`] - Compressed read-only images (mksquashfs)
//! - [`ext_image`] - Sized, populated ext4 images
//!
//! Every builder writes to a `<name>.tmp` sibling first and renames into
//! place only after the tool chain succeeded, so a final artifact path
//! never holds a half-written image.

pub mod ext_image;
pub mod filesystem;
pub mod squashfs;

pub use ext_image::{build_ext_image, ext_image_size};
pub use squashfs::{build_squashfs, SquashfsOptions};
