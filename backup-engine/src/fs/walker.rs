//! Directory traversal for checksums, size estimates and quota accounting.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
        })
    }
}

/// Walk a directory tree and collect its regular files, sorted by relative path.
///
/// Symlinks are not followed and are not reported.
pub fn walk_files(root: &Path) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(FileInfo::from_entry(&entry, root)?);
        }
    }
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Apparent size of a tree with every inode counted once.
///
/// Backups share unchanged files with their predecessors through hard links,
/// so summing `len()` naively would count shared data once per backup.
pub fn directory_size(root: &Path) -> std::io::Result<u64> {
    let mut seen = HashSet::new();
    let mut total = 0u64;

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        if metadata.nlink() > 1 && !seen.insert((metadata.dev(), metadata.ino())) {
            continue;
        }
        total += metadata.len();
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_files(temp_dir.path())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories_sorted() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("region"))?;
        fs::write(temp_dir.path().join("level.dat"), b"content1")?;
        fs::write(temp_dir.path().join("region/r.0.0.mca"), b"content2")?;

        let files = walk_files(temp_dir.path())?;
        let names: Vec<_> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["level.dat", "region/r.0.0.mca"]);
        assert_eq!(files[1].size, 8);

        Ok(())
    }

    #[test]
    fn test_symlinks_not_reported() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a"), b"x")?;
        std::os::unix::fs::symlink("a", temp_dir.path().join("b"))?;

        let files = walk_files(temp_dir.path())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, PathBuf::from("a"));
        Ok(())
    }

    #[test]
    fn test_directory_size_counts_hard_links_once() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("one"))?;
        fs::create_dir(temp_dir.path().join("two"))?;
        fs::write(temp_dir.path().join("one/file"), b"12345")?; // 5 bytes
        fs::hard_link(
            temp_dir.path().join("one/file"),
            temp_dir.path().join("two/file"),
        )?;
        fs::write(temp_dir.path().join("two/other"), b"1234567")?; // 7 bytes

        assert_eq!(directory_size(temp_dir.path())?, 12);
        assert_eq!(directory_size(&temp_dir.path().join("two"))?, 12);

        Ok(())
    }
}
