//! Change Detector: given a source root and a parent snapshot's file
//! list, yields the subset of paths that look modified, added or
//! deleted. False positives are tolerated (re-chunking an unchanged
//! file is wasted work but still correct since CAS dedup suppresses
//! re-storage); false negatives are not.

use std::collections::HashMap;
use std::path::Path;

use walkdir::WalkDir;

use crate::config::BackupOptions;
use crate::error::BackupError;
use crate::model::FileRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedChange {
    pub relative_path: String,
    pub status: ChangeStatus,
}

/// Contract an incremental backup's change source implements. The
/// core depends only on this interface; a plain walk-and-compare is
/// the only implementation shipped (`WalkChangeDetector`) but an
/// OS-specific change journal could satisfy the same contract.
pub trait ChangeDetector {
    fn detect(
        &self,
        source_root: &Path,
        parent_files: &[FileRecord],
        options: &BackupOptions,
    ) -> Result<Vec<DetectedChange>, BackupError>;
}

/// Reference implementation: a stable, depth-first, alphabetical
/// directory walk compared against the parent snapshot's file list
/// held in memory as a map keyed by `relative_path`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalkChangeDetector;

impl ChangeDetector for WalkChangeDetector {
    fn detect(
        &self,
        source_root: &Path,
        parent_files: &[FileRecord],
        options: &BackupOptions,
    ) -> Result<Vec<DetectedChange>, BackupError> {
        let parent_by_path: HashMap<&str, &FileRecord> = parent_files
            .iter()
            .map(|r| (r.relative_path.as_str(), r))
            .collect();

        let mut seen = std::collections::HashSet::new();
        let mut changes = Vec::new();

        let mut walker = WalkDir::new(source_root).sort_by_file_name();
        if let Some(max_depth) = options.max_depth {
            walker = walker.max_depth(max_depth);
        }

        for entry in walker {
            let entry = entry?;
            if entry.depth() == 0 {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            if !options.include_hidden && is_hidden(&relative) {
                continue;
            }

            if entry.file_type().is_dir() {
                continue;
            }

            seen.insert(relative.clone());

            let metadata = entry.metadata()?;
            let current_size = metadata.len();
            let current_mtime = metadata
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            match parent_by_path.get(relative.as_str()) {
                None => changes.push(DetectedChange {
                    relative_path: relative,
                    status: ChangeStatus::Added,
                }),
                Some(record) => {
                    if current_size != record.size || current_mtime > record.mtime_seconds {
                        changes.push(DetectedChange {
                            relative_path: relative,
                            status: ChangeStatus::Modified,
                        });
                    }
                }
            }
        }

        for record in parent_files {
            if !seen.contains(&record.relative_path) {
                changes.push(DetectedChange {
                    relative_path: record.relative_path.clone(),
                    status: ChangeStatus::Deleted,
                });
            }
        }

        Ok(changes)
    }
}

fn is_hidden(relative_path: &str) -> bool {
    relative_path
        .split('/')
        .any(|segment| segment.starts_with('.') && segment != "." && segment != "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Hasher, Sha256Hasher};
    use crate::model::{ChunkRef, ChunkingMode, FileType};
    use std::fs;
    use tempfile::tempdir;

    fn record(path: &str, size: u64, mtime: i64, hash: crate::hash::ChunkHash) -> FileRecord {
        FileRecord {
            relative_path: path.to_string(),
            size,
            mtime_seconds: mtime,
            mtime_nanos: 0,
            mode: 0o644,
            file_type: FileType::Regular,
            symlink_target: None,
            chunks: vec![ChunkRef {
                offset: 0,
                length: size,
                chunk_hash: hash,
            }],
            chunking_mode: ChunkingMode::Fixed,
            file_hash: hash,
        }
    }

    #[test]
    fn detects_added_modified_and_deleted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("unchanged.txt"), b"same").unwrap();
        fs::write(dir.path().join("changed.txt"), b"new content here").unwrap();
        fs::write(dir.path().join("new.txt"), b"brand new").unwrap();

        let hasher = Sha256Hasher;
        let parent_files = vec![
            record("unchanged.txt", 4, 0, hasher.hash(b"same")),
            record("changed.txt", 3, 0, hasher.hash(b"old")),
            record("gone.txt", 3, 0, hasher.hash(b"bye")),
        ];

        let detector = WalkChangeDetector;
        let options = BackupOptions::default();
        let changes = detector.detect(dir.path(), &parent_files, &options).unwrap();

        let added: Vec<_> = changes
            .iter()
            .filter(|c| c.status == ChangeStatus::Added)
            .collect();
        let modified: Vec<_> = changes
            .iter()
            .filter(|c| c.status == ChangeStatus::Modified)
            .collect();
        let deleted: Vec<_> = changes
            .iter()
            .filter(|c| c.status == ChangeStatus::Deleted)
            .collect();

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].relative_path, "new.txt");
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].relative_path, "changed.txt");
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].relative_path, "gone.txt");
    }

    #[test]
    fn hidden_files_excluded_by_default() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".secret"), b"hidden").unwrap();
        let detector = WalkChangeDetector;
        let options = BackupOptions::default();
        let changes = detector.detect(dir.path(), &[], &options).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn hidden_files_included_when_configured() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".secret"), b"hidden").unwrap();
        let detector = WalkChangeDetector;
        let mut options = BackupOptions::default();
        options.include_hidden = true;
        let changes = detector.detect(dir.path(), &[], &options).unwrap();
        assert_eq!(changes.len(), 1);
    }
}
