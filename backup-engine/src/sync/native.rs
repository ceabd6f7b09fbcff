//! Pure Rust sync port for hosts without rsync.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{FileSyncPort, SyncRequest, SyncStats};
use crate::fs::metadata::FileMetadata;
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSync;

impl NativeSync {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSyncPort for NativeSync {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn sync(&self, request: &SyncRequest, cancel: &CancellationToken) -> Result<SyncStats> {
        let request = request.clone();
        let cancel = cancel.clone();
        let stats = tokio::task::spawn_blocking(move || mirror(&request, &cancel)).await??;
        info!(
            files = stats.files_total,
            transferred = stats.files_transferred,
            bytes = stats.bytes_total,
            bytes_transferred = stats.bytes_transferred,
            "Native sync completed"
        );
        Ok(stats)
    }
}

fn transfer_err(path: &Path, err: impl std::fmt::Display) -> EngineError {
    EngineError::Transfer(format!("{}: {err}", path.display()))
}

/// What happened to one regular file of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Unchanged,
    Linked,
    Copied,
    /// Deleted from the source after the walk listed it
    Vanished,
}

fn vanished(err: &walkdir::Error) -> bool {
    err.io_error().map(|e| e.kind()) == Some(ErrorKind::NotFound)
}

fn mirror(request: &SyncRequest, cancel: &CancellationToken) -> Result<SyncStats> {
    let source = &request.source;
    let dest = &request.destination;
    if !source.is_dir() {
        return Err(EngineError::Transfer(format!(
            "source {} is not a directory",
            source.display()
        )));
    }
    fs::create_dir_all(dest).map_err(|e| transfer_err(dest, e))?;

    let mut stats = SyncStats::default();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for entry in WalkDir::new(source).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if vanished(&e) => {
                warn!(error = %e, "Source entry vanished during sync, skipped");
                continue;
            }
            Err(e) => return Err(transfer_err(source, e)),
        };
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| transfer_err(entry.path(), e))?
            .to_path_buf();
        let target = dest.join(&rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if !fs::symlink_metadata(&target).map(|m| m.is_dir()).unwrap_or(false) {
                remove_any(&target)?;
                fs::create_dir_all(&target).map_err(|e| transfer_err(&target, e))?;
            }
        } else if file_type.is_symlink() {
            sync_symlink(entry.path(), &target)?;
        } else if file_type.is_file() {
            let meta = match entry.metadata() {
                Ok(meta) => FileMetadata::from_metadata(&meta),
                Err(e) if vanished(&e) => {
                    warn!(path = %entry.path().display(), "File vanished during sync, skipped");
                    continue;
                }
                Err(e) => return Err(transfer_err(entry.path(), e)),
            };

            let base = request.reference_base.as_ref().map(|b| b.join(&rel));
            match sync_file(entry.path(), &target, base.as_deref(), &meta)? {
                FileOutcome::Vanished => {
                    warn!(path = %entry.path().display(), "File vanished during sync, skipped");
                    continue;
                }
                FileOutcome::Copied => {
                    stats.files_transferred += 1;
                    stats.bytes_transferred += meta.size;
                }
                FileOutcome::Unchanged | FileOutcome::Linked => {}
            }
            stats.files_total += 1;
            stats.bytes_total += meta.size;
        }
        // sockets, fifos and devices are not part of a world directory
        seen.insert(rel);
    }

    remove_extras(dest, &seen, cancel)?;
    Ok(stats)
}

fn sync_file(
    src: &Path,
    target: &Path,
    base: Option<&Path>,
    meta: &FileMetadata,
) -> Result<FileOutcome> {
    if let Ok(existing) = fs::symlink_metadata(target) {
        if existing.is_file() && FileMetadata::from_metadata(&existing).same_content_as(meta) {
            return Ok(FileOutcome::Unchanged);
        }
    }

    if let Some(base) = base {
        if let Ok(base_meta) = fs::symlink_metadata(base) {
            if base_meta.is_file() && FileMetadata::from_metadata(&base_meta).same_content_as(meta) {
                remove_any(target)?;
                fs::hard_link(base, target).map_err(|e| transfer_err(target, e))?;
                debug!(path = %target.display(), "Hard-linked from reference");
                return Ok(FileOutcome::Linked);
            }
        }
    }

    let mut reader = match File::open(src) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(FileOutcome::Vanished),
        Err(e) => return Err(transfer_err(src, e)),
    };
    // never write through an existing link, it may be shared with an older backup
    remove_any(target)?;
    meta.write_copy(&mut reader, target)
        .map_err(|e| transfer_err(target, e))?;
    Ok(FileOutcome::Copied)
}

fn sync_symlink(src: &Path, target: &Path) -> Result<()> {
    let link = fs::read_link(src).map_err(|e| transfer_err(src, e))?;
    if fs::read_link(target).ok().as_deref() == Some(link.as_path()) {
        return Ok(());
    }
    remove_any(target)?;
    std::os::unix::fs::symlink(&link, target).map_err(|e| transfer_err(target, e))?;
    Ok(())
}

fn remove_extras(dest: &Path, keep: &HashSet<PathBuf>, cancel: &CancellationToken) -> Result<()> {
    for entry in WalkDir::new(dest).min_depth(1).contents_first(true) {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let entry = entry.map_err(|e| transfer_err(dest, e))?;
        let rel = entry
            .path()
            .strip_prefix(dest)
            .map_err(|e| transfer_err(entry.path(), e))?;
        if keep.contains(rel) {
            continue;
        }
        debug!(path = %entry.path().display(), "Deleting extraneous entry");
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(transfer_err(entry.path(), e)),
        }
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| transfer_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn world(root: &Path) {
        fs::create_dir_all(root.join("region")).unwrap();
        fs::write(root.join("level.dat"), b"level-data").unwrap();
        fs::write(root.join("region/r.0.0.mca"), b"chunk-data-0").unwrap();
    }

    async fn run(req: SyncRequest) -> Result<SyncStats> {
        NativeSync::new().sync(&req, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_full_copy_counts_everything() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        world(&live);

        let stats = run(SyncRequest::new(&live, dir.path().join("b1"))).await.unwrap();
        assert_eq!(stats.files_total, 2);
        assert_eq!(stats.files_transferred, 2);
        assert_eq!(stats.bytes_total, 22);
        assert_eq!(stats.bytes_transferred, 22);
        assert_eq!(fs::read(dir.path().join("b1/level.dat")).unwrap(), b"level-data");
    }

    #[tokio::test]
    async fn test_unchanged_files_hard_linked_against_base() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        world(&live);
        run(SyncRequest::new(&live, dir.path().join("b1"))).await.unwrap();

        fs::write(live.join("level.dat"), b"level-data-v2").unwrap();
        let stats = run(
            SyncRequest::new(&live, dir.path().join("b2"))
                .with_reference(Some(dir.path().join("b1"))),
        )
        .await
        .unwrap();

        assert_eq!(stats.files_total, 2);
        assert_eq!(stats.files_transferred, 1);
        assert_eq!(stats.bytes_transferred, 13);

        let old = fs::metadata(dir.path().join("b1/region/r.0.0.mca")).unwrap();
        let new = fs::metadata(dir.path().join("b2/region/r.0.0.mca")).unwrap();
        assert_eq!(old.ino(), new.ino());
        assert_eq!(fs::read(dir.path().join("b1/level.dat")).unwrap(), b"level-data");
    }

    #[tokio::test]
    async fn test_mirror_removes_extras_and_skips_identical() {
        let dir = TempDir::new().unwrap();
        let backup = dir.path().join("backup");
        let live = dir.path().join("live");
        world(&backup);
        run(SyncRequest::new(&backup, &live)).await.unwrap();

        fs::create_dir_all(live.join("DIM-1/region")).unwrap();
        fs::write(live.join("DIM-1/region/r.1.1.mca"), b"new").unwrap();
        fs::write(live.join("session.lock"), b"lock").unwrap();

        let stats = run(SyncRequest::new(&backup, &live)).await.unwrap();
        assert_eq!(stats.files_transferred, 0);
        assert!(!live.join("DIM-1").exists());
        assert!(!live.join("session.lock").exists());
        assert!(live.join("region/r.0.0.mca").exists());
    }

    #[tokio::test]
    async fn test_symlinks_recreated() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        world(&live);
        std::os::unix::fs::symlink("level.dat", live.join("level.link")).unwrap();

        let dest = dir.path().join("b1");
        run(SyncRequest::new(&live, &dest)).await.unwrap();
        assert_eq!(fs::read_link(dest.join("level.link")).unwrap(), PathBuf::from("level.dat"));
    }

    #[tokio::test]
    async fn test_cancelled_sync_stops() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        world(&live);

        let token = CancellationToken::new();
        token.cancel();
        let result = NativeSync::new()
            .sync(&SyncRequest::new(&live, dir.path().join("b1")), &token)
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_source_is_transfer_error() {
        let dir = TempDir::new().unwrap();
        let result = run(SyncRequest::new(dir.path().join("nope"), dir.path().join("b1"))).await;
        assert!(matches!(result, Err(EngineError::Transfer(_))));
    }

    #[tokio::test]
    async fn test_read_only_files_copied_with_mode_and_mtime() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        world(&live);
        let level = live.join("level.dat");
        let past = SystemTime::now() - Duration::from_secs(86_400);
        File::options().write(true).open(&level).unwrap().set_modified(past).unwrap();
        fs::set_permissions(&level, fs::Permissions::from_mode(0o444)).unwrap();

        let dest = dir.path().join("b1");
        let stats = run(SyncRequest::new(&live, &dest)).await.unwrap();
        assert_eq!(stats.files_transferred, 2);

        let copied = fs::metadata(dest.join("level.dat")).unwrap();
        assert_eq!(copied.mode() & 0o777, 0o444);
        assert_eq!(copied.mtime(), fs::metadata(&level).unwrap().mtime());
        assert_eq!(fs::read(dest.join("level.dat")).unwrap(), b"level-data");

        // second pass sees the read-only copy as unchanged
        let again = run(SyncRequest::new(&live, &dest)).await.unwrap();
        assert_eq!(again.files_transferred, 0);
    }

    #[test]
    fn test_vanished_file_skipped() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("session.lock");
        fs::write(&src, b"lock").unwrap();
        let meta = FileMetadata::from_metadata(&fs::metadata(&src).unwrap());
        fs::remove_file(&src).unwrap();

        let target = dir.path().join("copy");
        let outcome = sync_file(&src, &target, None, &meta).unwrap();
        assert_eq!(outcome, FileOutcome::Vanished);
        assert!(!target.exists());
    }
}
