//! Restore Coordinator: reads a committed snapshot's file list, pulls
//! chunks from the CAS in order, and reconstructs an exact byte-for-
//! byte copy of the snapshot at a target directory.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use rayon::prelude::*;

use crate::catalog::Catalog;
use crate::config::{JobOutcome, RestoreOptions};
use crate::error::BackupError;
use crate::hash::Hasher;
use crate::model::{FileRecord, FileType, JobStats};
use crate::progress::ProgressSink;
use crate::store::ChunkStore;

pub struct RestoreCoordinator {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn ChunkStore>,
    hasher: Arc<dyn Hasher>,
}

impl RestoreCoordinator {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<dyn ChunkStore>, hasher: Arc<dyn Hasher>) -> Self {
        Self {
            catalog,
            store,
            hasher,
        }
    }

    pub fn restore(
        &self,
        snapshot_id: &str,
        target_dir: &Path,
        options: &RestoreOptions,
        progress: &dyn ProgressSink,
    ) -> Result<JobOutcome, BackupError> {
        let snapshot = self
            .catalog
            .get_snapshot(snapshot_id)?
            .ok_or_else(|| BackupError::snapshot_not_found(snapshot_id))?;
        if !snapshot.committed {
            return Err(BackupError::snapshot_not_committed(snapshot_id));
        }

        self.prepare_target(target_dir, options)?;

        let mut records = self.catalog.list_files(snapshot_id)?;
        records.retain(|r| self.passes_filters(r, options));
        records.sort_by(|a, b| file_ordering_key(a).cmp(&file_ordering_key(b)));

        let directories: Vec<&FileRecord> = records.iter().filter(|r| r.file_type == FileType::Directory).collect();
        for dir in &directories {
            fs::create_dir_all(target_dir.join(&dir.relative_path))?;
        }

        let files: Vec<&FileRecord> = records
            .iter()
            .filter(|r| r.file_type != FileType::Directory)
            .collect();

        let results: Vec<Result<(String, u64), (String, String)>> = files
            .par_iter()
            .map(|record| {
                progress.on_file_start(&record.relative_path);
                self.restore_one(record, target_dir, options)
                    .map(|bytes| (record.relative_path.clone(), bytes))
                    .map_err(|e| (record.relative_path.clone(), e.to_string()))
            })
            .collect();

        let mut stats = JobStats::default();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok((path, bytes)) => {
                    progress.on_file_processed(&path, bytes);
                    stats.files_processed += 1;
                    stats.bytes_processed += bytes;
                }
                Err((path, message)) => {
                    progress.on_file_error(&path, &message);
                    errors.push(format!("{path}: {message}"));
                }
            }
        }
        stats.files_errored = errors.len() as u64;

        Ok(JobOutcome {
            snapshot_id: Some(snapshot_id.to_string()),
            stats,
            errors,
            fatal: None,
            store_corrupt: false,
        })
    }

    fn prepare_target(&self, target_dir: &Path, options: &RestoreOptions) -> Result<(), BackupError> {
        if target_dir.exists() {
            let mut entries = fs::read_dir(target_dir)?;
            if entries.next().is_some() {
                if options.backup_existing {
                    let backup_path = target_dir.with_extension("bak");
                    fs::rename(target_dir, &backup_path)?;
                    fs::create_dir_all(target_dir)?;
                } else if !options.overwrite {
                    return Err(BackupError::target_not_empty(target_dir));
                }
            }
        } else {
            fs::create_dir_all(target_dir)?;
        }
        Ok(())
    }

    fn passes_filters(&self, record: &FileRecord, options: &RestoreOptions) -> bool {
        if !options.include.is_empty() {
            let included = options
                .include
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .any(|p| p.matches(&record.relative_path));
            if !included {
                return false;
            }
        }
        if options
            .exclude
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|p| p.matches(&record.relative_path))
        {
            return false;
        }
        true
    }

    fn restore_one(
        &self,
        record: &FileRecord,
        target_dir: &Path,
        options: &RestoreOptions,
    ) -> Result<u64, BackupError> {
        let target_path = target_dir.join(&record.relative_path);
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if record.file_type == FileType::Symlink {
            if let Some(target) = &record.symlink_target {
                #[cfg(unix)]
                std::os::unix::fs::symlink(target, &target_path)?;
                #[cfg(not(unix))]
                let _ = target_path;
            }
            return Ok(0);
        }

        let mut file = File::create(&target_path)?;
        let mut written = Vec::with_capacity(record.size as usize);
        for chunk in &record.chunks {
            let bytes = self.get_chunk_with_retry(chunk.chunk_hash, options.max_chunk_retries)?;
            file.write_all(&bytes)?;
            written.extend_from_slice(&bytes);
        }
        file.sync_all()?;

        if !options.no_verify {
            let actual = crate::merkle::file_hash(self.hasher.as_ref(), written.len() as u64, &record.chunks);
            if actual != record.file_hash {
                return Err(BackupError::restore_verification(&target_path));
            }
        }

        if !options.no_preserve_attributes {
            self.apply_attributes(&target_path, record)?;
        }

        Ok(written.len() as u64)
    }

    fn get_chunk_with_retry(&self, hash: crate::hash::ChunkHash, max_retries: u32) -> Result<Vec<u8>, BackupError> {
        let mut attempt = 0;
        loop {
            match self.store.get(hash) {
                Ok(bytes) => return Ok(bytes),
                Err(e @ BackupError::Integrity(_)) => return Err(e),
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    log::warn!("retrying chunk {hash} after transient error: {e}");
                    std::thread::sleep(Duration::from_millis(50 * attempt as u64));
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(unix)]
    fn apply_attributes(&self, path: &Path, record: &FileRecord) -> Result<(), BackupError> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(record.mode))?;
        let mtime = filetime::FileTime::from_unix_time(record.mtime_seconds, record.mtime_nanos);
        filetime::set_file_mtime(path, mtime)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn apply_attributes(&self, path: &Path, record: &FileRecord) -> Result<(), BackupError> {
        let mtime = filetime::FileTime::from_unix_time(record.mtime_seconds, record.mtime_nanos);
        filetime::set_file_mtime(path, mtime)?;
        Ok(())
    }
}

/// Directories first, then files, both ordered by path so parents are
/// always created before their children are restored into them.
fn file_ordering_key(record: &FileRecord) -> (u8, &str) {
    let kind_rank = if record.file_type == FileType::Directory { 0 } else { 1 };
    (kind_rank, record.relative_path.as_str())
}
