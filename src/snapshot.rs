//! Directory snapshots for locating newly created agent logs
//!
//! A snapshot is taken before the agent starts and again after it had time
//! to create its log; the difference is the candidate set for correlation.

use crate::data::{FileEntry, FileSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recursively list every file under `dir`.
///
/// A missing directory yields an empty snapshot; entries that vanish or
/// cannot be stat'ed mid-walk are skipped.
pub fn snapshot(dir: &Path) -> FileSnapshot {
    let taken_at = Utc::now();

    if !dir.exists() {
        return FileSnapshot {
            files: Vec::new(),
            taken_at,
        };
    }

    let files = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| file_entry(e.path()))
        .collect();

    FileSnapshot { files, taken_at }
}

/// Stat a single file into a [`FileEntry`].
pub fn file_entry(path: &Path) -> Option<FileEntry> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified_at: DateTime<Utc> = metadata.modified().ok()?.into();
    let created_at = metadata.created().ok().map(DateTime::<Utc>::from);

    Some(FileEntry {
        path: path.to_path_buf(),
        size: metadata.len(),
        modified_at,
        created_at,
    })
}

/// Files present in `after` but absent from `before`, compared by path.
pub fn diff(before: &FileSnapshot, after: &FileSnapshot) -> Vec<FileEntry> {
    let known: HashSet<&PathBuf> = before.files.iter().map(|f| &f.path).collect();

    after
        .files
        .iter()
        .filter(|f| !known.contains(&f.path))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_directory_is_empty() {
        let snap = snapshot(Path::new("/nonexistent/sessiontap/dir"));
        assert!(snap.files.is_empty());
    }

    #[test]
    fn test_snapshot_is_recursive() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        fs::write(temp_dir.path().join("top.jsonl"), "x").unwrap();
        fs::write(temp_dir.path().join("a/b/deep.jsonl"), "yy").unwrap();

        let snap = snapshot(temp_dir.path());
        assert_eq!(snap.files.len(), 2);

        let deep = snap
            .files
            .iter()
            .find(|f| f.path.ends_with("a/b/deep.jsonl"))
            .unwrap();
        assert_eq!(deep.size, 2);
    }

    #[test]
    fn test_diff_returns_new_files_only() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("old.jsonl"), "").unwrap();
        let before = snapshot(temp_dir.path());

        fs::write(temp_dir.path().join("new.jsonl"), "").unwrap();
        // Growing an existing file does not make it new
        fs::write(temp_dir.path().join("old.jsonl"), "more").unwrap();
        let after = snapshot(temp_dir.path());

        let new_files = diff(&before, &after);
        assert_eq!(new_files.len(), 1);
        assert!(new_files[0].path.ends_with("new.jsonl"));
    }

    #[test]
    fn test_diff_identical_snapshots_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.jsonl"), "").unwrap();
        let snap = snapshot(temp_dir.path());
        assert!(diff(&snap, &snap).is_empty());
    }
}
