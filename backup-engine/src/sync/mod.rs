//! Incremental directory copy with hard-link deduplication.
//!
//! Every sync has mirror semantics: after it completes the destination holds
//! exactly the files of the source. When a reference base is given, files
//! unchanged relative to it are hard-linked instead of copied.

pub mod native;
pub mod rsync;

use async_trait::async_trait;
use serde::Serialize;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::fs::walker::directory_size;
use crate::utils::errors::Result;

pub use native::NativeSync;
pub use rsync::RsyncSync;

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Previous copy of the same tree to hard-link unchanged files against
    pub reference_base: Option<PathBuf>,
}

impl SyncRequest {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            reference_base: None,
        }
    }

    pub fn with_reference(mut self, base: Option<PathBuf>) -> Self {
        self.reference_base = base;
        self
    }
}

/// Transfer statistics of one or more syncs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub files_total: u64,
    pub files_transferred: u64,
    pub bytes_total: u64,
    pub bytes_transferred: u64,
}

impl AddAssign for SyncStats {
    fn add_assign(&mut self, other: Self) {
        self.files_total += other.files_total;
        self.files_transferred += other.files_transferred;
        self.bytes_total += other.bytes_total;
        self.bytes_transferred += other.bytes_transferred;
    }
}

#[async_trait]
pub trait FileSyncPort: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Bytes a full copy of `path` would occupy.
    async fn estimate_size(&self, path: &Path) -> Result<u64> {
        let path = path.to_path_buf();
        Ok(tokio::task::spawn_blocking(move || directory_size(&path)).await??)
    }

    /// Mirror `request.source` into `request.destination`.
    ///
    /// Must return [`crate::EngineError::Cancelled`] promptly once `cancel` fires.
    async fn sync(&self, request: &SyncRequest, cancel: &CancellationToken) -> Result<SyncStats>;
}
