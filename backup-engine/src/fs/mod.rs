//! Filesystem helpers shared by the sync, checksum and storage modules.

pub mod metadata;
pub mod walker;

pub use metadata::FileMetadata;
pub use walker::{directory_size, walk_files, FileInfo};
