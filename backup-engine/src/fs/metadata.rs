//! File metadata used to decide whether a file changed between snapshots.
//!
//! Two files are considered identical when size and modification time match,
//! the same quick check rsync applies before hard-linking against a reference.

use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::SystemTime;

/// Metadata copied along with file contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: SystemTime,

    /// Unix mode bits
    pub mode: u32,
}

impl FileMetadata {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            mode: metadata.mode(),
        }
    }

    /// Size and mtime (to the second) both match.
    pub fn same_content_as(&self, other: &FileMetadata) -> bool {
        self.size == other.size && mtime_secs(self.modified) == mtime_secs(other.modified)
    }

    /// Write `reader` into a new file at `target` carrying this mtime and mode.
    ///
    /// The target is created owner-writable and both attributes are set
    /// through the open handle, so read-only sources copy without a reopen.
    pub fn write_copy<R: Read>(&self, reader: &mut R, target: &Path) -> io::Result<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(target)?;
        let bytes = io::copy(reader, &mut file)?;
        file.set_modified(self.modified)?;
        file.set_permissions(fs::Permissions::from_mode(self.mode & 0o7777))?;
        Ok(bytes)
    }
}

fn mtime_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
