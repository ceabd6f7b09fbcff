//! Per-file SHA-256 manifests for backups.
//!
//! Each backup `<name>` gets `checksums/<name>.sha256` in `sha256sum` format
//! (`<hex>  <relative path>`), so a set can also be checked by hand with
//! `sha256sum -c` from inside the backup directory.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::fs::walker::walk_files;
use crate::utils::errors::{EngineError, Result};

/// Relative path (forward slashes) -> lowercase hex digest
pub type ChecksumSet = BTreeMap<String, String>;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct GenerateSummary {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    /// Entries in the stored set
    pub checked: usize,
    /// Present with a different hash
    pub mismatched: Vec<String>,
    /// Listed in the set but absent on disk
    pub missing: Vec<String>,
    /// On disk but not listed
    pub unexpected: Vec<String>,
}

impl VerifyReport {
    pub fn mismatch_count(&self) -> usize {
        self.mismatched.len() + self.missing.len() + self.unexpected.len()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChecksumDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: usize,
}

#[derive(Debug, Clone)]
pub struct ChecksumManager {
    dir: PathBuf,
}

impl ChecksumManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn set_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.sha256"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.set_path(name).is_file()
    }

    /// Hash every file under `backup_path` and persist the set under `name`.
    pub async fn generate(&self, backup_path: &Path, name: &str) -> Result<GenerateSummary> {
        let root = backup_path.to_path_buf();
        let target = self.set_path(name);
        let dir = self.dir.clone();

        let summary = tokio::task::spawn_blocking(move || -> Result<GenerateSummary> {
            let (set, bytes) = compute_set(&root)?;
            fs::create_dir_all(&dir)?;
            write_set(&target, &set)?;
            Ok(GenerateSummary {
                files: set.len(),
                bytes,
            })
        })
        .await??;

        info!(backup = %name, files = summary.files, "Checksums generated");
        Ok(summary)
    }

    pub async fn read(&self, name: &str) -> Result<Option<ChecksumSet>> {
        let path = self.set_path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(parse_set(&content))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Recompute hashes for `backup_path` and compare against the stored set.
    /// Every discrepancy is collected; nothing aborts early.
    pub async fn verify(&self, backup_path: &Path, name: &str) -> Result<VerifyReport> {
        let expected = self.read(name).await?.ok_or_else(|| {
            EngineError::Verification(format!("no checksum set exists for '{name}'"))
        })?;

        let root = backup_path.to_path_buf();
        let (actual, _) = tokio::task::spawn_blocking(move || compute_set(&root)).await??;

        let mut report = VerifyReport {
            checked: expected.len(),
            ..Default::default()
        };
        for (path, hash) in &expected {
            match actual.get(path) {
                Some(found) if found == hash => {}
                Some(_) => report.mismatched.push(path.clone()),
                None => report.missing.push(path.clone()),
            }
        }
        report.unexpected = actual
            .keys()
            .filter(|p| !expected.contains_key(*p))
            .cloned()
            .collect();
        report.valid = report.mismatch_count() == 0;

        if report.valid {
            info!(backup = %name, files = report.checked, "Checksum verification passed");
        } else {
            warn!(
                backup = %name,
                mismatched = report.mismatched.len(),
                missing = report.missing.len(),
                unexpected = report.unexpected.len(),
                "Checksum verification failed"
            );
        }
        Ok(report)
    }

    /// Classify every path across two stored sets.
    pub async fn diff(&self, from: &str, to: &str) -> Result<ChecksumDiff> {
        let a = self
            .read(from)
            .await?
            .ok_or_else(|| EngineError::BackupNotFound(format!("no checksum set for '{from}'")))?;
        let b = self
            .read(to)
            .await?
            .ok_or_else(|| EngineError::BackupNotFound(format!("no checksum set for '{to}'")))?;
        Ok(diff_sets(&a, &b))
    }

    /// Returns false when there was nothing to delete.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.set_path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn diff_sets(from: &ChecksumSet, to: &ChecksumSet) -> ChecksumDiff {
    let mut diff = ChecksumDiff::default();
    for (path, hash) in to {
        match from.get(path) {
            None => diff.added.push(path.clone()),
            Some(old) if old != hash => diff.modified.push(path.clone()),
            Some(_) => diff.unchanged += 1,
        }
    }
    diff.removed = from
        .keys()
        .filter(|p| !to.contains_key(*p))
        .cloned()
        .collect();
    diff
}

/// Stream a file through SHA-256 in fixed-size chunks.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn compute_set(root: &Path) -> Result<(ChecksumSet, u64)> {
    if !root.is_dir() {
        return Err(EngineError::BackupNotFound(root.display().to_string()));
    }
    let mut set = ChecksumSet::new();
    let mut bytes = 0u64;
    for file in walk_files(root)? {
        let rel = set_key(&file.relative_path)?;
        set.insert(rel, hash_file(&file.path)?);
        bytes += file.size;
    }
    Ok((set, bytes))
}

/// Checksum sets are line-oriented UTF-8, so a path must be valid UTF-8
/// without newlines to get an unambiguous key.
fn set_key(relative: &Path) -> Result<String> {
    match relative.to_str() {
        Some(key) if !key.contains('\n') => Ok(key.to_string()),
        _ => Err(EngineError::Precondition(format!(
            "file name cannot be recorded in a checksum set: {}",
            relative.display()
        ))),
    }
}

fn write_set(target: &Path, set: &ChecksumSet) -> Result<()> {
    let tmp = target.with_extension("sha256.tmp");
    {
        let mut out = std::io::BufWriter::new(File::create(&tmp)?);
        for (path, hash) in set {
            writeln!(out, "{hash}  {path}")?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
    }
    fs::rename(&tmp, target)?;
    Ok(())
}

fn parse_set(content: &str) -> ChecksumSet {
    content
        .lines()
        .filter_map(|line| line.split_once("  "))
        .map(|(hash, path)| (path.to_string(), hash.trim().to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use tempfile::TempDir;

    fn backup(root: &Path) {
        fs::create_dir_all(root.join("world/region")).unwrap();
        fs::write(root.join("world/level.dat"), b"level").unwrap();
        fs::write(root.join("world/region/r.0.0.mca"), b"region").unwrap();
    }

    #[tokio::test]
    async fn test_verify_after_generate_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("2025-01-01_000000");
        backup(&path);
        let manager = ChecksumManager::new(dir.path().join("checksums"));

        let summary = manager.generate(&path, "2025-01-01_000000").await.unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.bytes, 11);
        assert!(manager.exists("2025-01-01_000000"));

        let report = manager.verify(&path, "2025-01-01_000000").await.unwrap();
        assert!(report.valid);
        assert_eq!(report.checked, 2);
        assert_eq!(report.mismatch_count(), 0);
    }

    #[tokio::test]
    async fn test_verify_aggregates_all_discrepancies() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b");
        backup(&path);
        let manager = ChecksumManager::new(dir.path().join("checksums"));
        manager.generate(&path, "b").await.unwrap();

        fs::write(path.join("world/level.dat"), b"tampered").unwrap();
        fs::remove_file(path.join("world/region/r.0.0.mca")).unwrap();
        fs::write(path.join("world/extra.dat"), b"x").unwrap();

        let report = manager.verify(&path, "b").await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.mismatched, vec!["world/level.dat"]);
        assert_eq!(report.missing, vec!["world/region/r.0.0.mca"]);
        assert_eq!(report.unexpected, vec!["world/extra.dat"]);
        assert_eq!(report.mismatch_count(), 3);
    }

    #[tokio::test]
    async fn test_verify_without_set_is_verification_error() {
        let dir = TempDir::new().unwrap();
        let manager = ChecksumManager::new(dir.path().join("checksums"));
        let result = manager.verify(dir.path(), "missing").await;
        assert!(matches!(result, Err(EngineError::Verification(_))));
    }

    #[tokio::test]
    async fn test_file_format_is_sha256sum_compatible() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("hello.txt"), b"hello").unwrap();
        let manager = ChecksumManager::new(dir.path().join("checksums"));
        manager.generate(&path, "b").await.unwrap();

        let content = fs::read_to_string(dir.path().join("checksums/b.sha256")).unwrap();
        assert_eq!(
            content,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824  hello.txt\n"
        );
    }

    #[tokio::test]
    async fn test_diff_classifies_paths() {
        let dir = TempDir::new().unwrap();
        let manager = ChecksumManager::new(dir.path().join("checksums"));
        let a = dir.path().join("a");
        backup(&a);
        manager.generate(&a, "a").await.unwrap();

        let b = dir.path().join("b");
        backup(&b);
        fs::write(b.join("world/level.dat"), b"changed").unwrap();
        fs::remove_file(b.join("world/region/r.0.0.mca")).unwrap();
        fs::write(b.join("world/new.dat"), b"new").unwrap();
        manager.generate(&b, "b").await.unwrap();

        let diff = manager.diff("a", "b").await.unwrap();
        assert_eq!(diff.added, vec!["world/new.dat"]);
        assert_eq!(diff.removed, vec!["world/region/r.0.0.mca"]);
        assert_eq!(diff.modified, vec!["world/level.dat"]);
        assert_eq!(diff.unchanged, 0);

        assert!(matches!(
            manager.diff("a", "nope").await,
            Err(EngineError::BackupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b");
        backup(&path);
        let manager = ChecksumManager::new(dir.path().join("checksums"));
        manager.generate(&path, "b").await.unwrap();

        assert!(manager.delete("b").await.unwrap());
        assert!(!manager.delete("b").await.unwrap());
        assert!(manager.read("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_utf8_names_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b");
        backup(&path);
        // two names that a lossy conversion would map to the same key
        fs::write(path.join("world").join(OsStr::from_bytes(b"r.\xff.mca")), b"one").unwrap();
        fs::write(path.join("world").join(OsStr::from_bytes(b"r.\xfe.mca")), b"two").unwrap();
        let manager = ChecksumManager::new(dir.path().join("checksums"));

        let result = manager.generate(&path, "b").await;
        assert!(matches!(result, Err(EngineError::Precondition(_))));
        assert!(!manager.exists("b"));
    }

    #[test]
    fn test_set_key_keeps_backslashes() {
        assert_eq!(set_key(Path::new("world/a\\b.dat")).unwrap(), "world/a\\b.dat");
        assert!(set_key(Path::new("world/line\nbreak")).is_err());
    }
}
