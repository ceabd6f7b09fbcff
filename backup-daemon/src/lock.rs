//! Process-level exclusive lock on the backup root.
//!
//! The engine's job slot only guards one process. The lock keeps a second
//! daemon, or a mutating CLI command, from working on the same root.

use anyhow::{anyhow, Context};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE: &str = ".world-backup.lock";

pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(backup_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(backup_dir)
            .with_context(|| format!("Failed to create {}", backup_dir.display()))?;
        let path = backup_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow!(
                "another world-backup instance holds {} (use the HTTP API of the running daemon)",
                path.display()
            )
        })?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "Instance lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
