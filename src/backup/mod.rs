//! Backup Coordinator: the top-level state machine that drives
//! scan → (chunk → hash → store) → record → merkle → commit.
//!
//! INIT → SCAN → PROCESS → (PROCESS)* → MERKLE → COMMIT → DONE
//!                                                      ↘ FAILED

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::catalog::{Catalog, SnapshotHandle};
use crate::chunk::{self, CdcChunker, Chunker, FixedSizeChunker, ZeroSentinelCache};
use crate::config::{BackupOptions, JobOutcome, SymlinkStrategy};
use crate::constants::{SNAPSHOT_ID_PREFIX_FULL, SNAPSHOT_ID_PREFIX_INCREMENTAL};
use crate::detect::ChangeDetector;
use crate::error::BackupError;
use crate::hash::Hasher;
use crate::merkle;
use crate::model::{ChunkRef, ChunkingMode, FileRecord, FileType, JobStats};
use crate::progress::ProgressSink;
use crate::store::ChunkStore;

/// A file discovered by the scan step, before it has been read.
struct ScanEntry {
    relative_path: String,
    absolute_path: PathBuf,
    file_type: FileType,
    symlink_target: Option<String>,
}

pub struct BackupCoordinator {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn ChunkStore>,
    hasher: Arc<dyn Hasher>,
}

impl BackupCoordinator {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<dyn ChunkStore>, hasher: Arc<dyn Hasher>) -> Self {
        Self {
            catalog,
            store,
            hasher,
        }
    }

    /// Runs a full backup: every file under `source_root` is scanned
    /// and processed, regardless of any prior snapshot.
    pub fn run_full(
        &self,
        source_root: &Path,
        options: &BackupOptions,
        progress: &dyn ProgressSink,
    ) -> Result<JobOutcome, BackupError> {
        let snapshot_id = options
            .snapshot_name
            .clone()
            .unwrap_or_else(|| format!("{SNAPSHOT_ID_PREFIX_FULL}-{}", Utc::now().to_rfc3339()));

        let handle = match self.init(source_root, &snapshot_id, options, None) {
            Ok(handle) => handle,
            Err(e) => return Ok(self.fail_before_create(&snapshot_id, e)),
        };

        let entries = match self.scan(source_root, options) {
            Ok(entries) => entries,
            Err(e) => return Ok(self.fail(&snapshot_id, e)),
        };

        let (processed, mut stats, errors) = self.process_all(&entries, options, progress);
        for record in &processed {
            if let Err(e) = self.catalog.append_file(&handle, record) {
                return Ok(self.fail(&snapshot_id, e));
            }
        }
        stats.files_errored = errors.len() as u64;

        match self.finish(&handle) {
            Ok(()) => Ok(JobOutcome {
                snapshot_id: Some(snapshot_id),
                stats,
                errors,
                fatal: None,
                store_corrupt: false,
            }),
            Err(e) => Ok(self.fail(&snapshot_id, e)),
        }
    }

    /// Runs an incremental backup against `parent_snapshot_id`: only
    /// files the change detector flags are re-chunked; everything else
    /// is copy-forwarded by reference.
    pub fn run_incremental(
        &self,
        source_root: &Path,
        parent_snapshot_id: &str,
        options: &BackupOptions,
        progress: &dyn ProgressSink,
        detector: &dyn ChangeDetector,
    ) -> Result<JobOutcome, BackupError> {
        let snapshot_id = options.snapshot_name.clone().unwrap_or_else(|| {
            format!("{SNAPSHOT_ID_PREFIX_INCREMENTAL}-{}", Utc::now().to_rfc3339())
        });

        let parent = match self.catalog.get_snapshot(parent_snapshot_id) {
            Ok(parent) => parent,
            Err(e) => return Ok(self.fail_before_create(&snapshot_id, e)),
        };
        let parent = match parent {
            Some(p) if p.committed => p,
            Some(_) => return Ok(self.fail_before_create(&snapshot_id, BackupError::snapshot_not_committed(parent_snapshot_id))),
            None => return Ok(self.fail_before_create(&snapshot_id, BackupError::snapshot_not_found(parent_snapshot_id))),
        };

        let handle = match self.init(source_root, &snapshot_id, options, Some(&parent.id)) {
            Ok(handle) => handle,
            Err(e) => return Ok(self.fail_before_create(&snapshot_id, e)),
        };

        let parent_files = match self.catalog.list_files(&parent.id) {
            Ok(files) => files,
            Err(e) => return Ok(self.fail(&snapshot_id, e)),
        };

        let changes = match detector.detect(source_root, &parent_files, options) {
            Ok(c) => c,
            Err(e) => return Ok(self.fail(&snapshot_id, e)),
        };

        let mut changed_paths = HashSet::new();
        let mut to_process = Vec::new();
        for change in &changes {
            changed_paths.insert(change.relative_path.clone());
            if change.status != crate::detect::ChangeStatus::Deleted {
                to_process.push(ScanEntry {
                    relative_path: change.relative_path.clone(),
                    absolute_path: source_root.join(&change.relative_path),
                    file_type: FileType::Regular,
                    symlink_target: None,
                });
            }
        }

        let (processed, mut stats, errors) = self.process_all(&to_process, options, progress);
        for record in &processed {
            if let Err(e) = self.catalog.append_file(&handle, record) {
                return Ok(self.fail(&snapshot_id, e));
            }
        }
        stats.files_errored = errors.len() as u64;

        if let Err(e) = self.catalog.copy_unchanged(&parent.id, &handle, &changed_paths) {
            return Ok(self.fail(&snapshot_id, e));
        }

        match self.finish(&handle) {
            Ok(()) => Ok(JobOutcome {
                snapshot_id: Some(snapshot_id),
                stats,
                errors,
                fatal: None,
                store_corrupt: false,
            }),
            Err(e) => Ok(self.fail(&snapshot_id, e)),
        }
    }

    fn init(
        &self,
        source_root: &Path,
        snapshot_id: &str,
        options: &BackupOptions,
        parent: Option<&str>,
    ) -> Result<SnapshotHandle, BackupError> {
        if !source_root.is_dir() {
            return Err(BackupError::invalid_source(source_root));
        }
        let description = options
            .description
            .clone()
            .unwrap_or_else(|| source_root.to_string_lossy().to_string());
        self.catalog
            .create_snapshot(snapshot_id, &description, &source_root.to_string_lossy(), parent)
    }

    fn fail(&self, snapshot_id: &str, error: BackupError) -> JobOutcome {
        let store_corrupt = error.is_store_fatal();
        if store_corrupt {
            log::error!("backup job {snapshot_id} failed with store corruption: {error}");
        } else {
            log::error!("backup job {snapshot_id} failed: {error}");
        }
        JobOutcome {
            snapshot_id: Some(snapshot_id.to_string()),
            stats: JobStats::default(),
            errors: Vec::new(),
            fatal: Some(error.to_string()),
            store_corrupt,
        }
    }

    fn fail_before_create(&self, snapshot_id: &str, error: BackupError) -> JobOutcome {
        let store_corrupt = error.is_store_fatal();
        log::error!("backup job {snapshot_id} failed before snapshot creation: {error}");
        JobOutcome {
            snapshot_id: None,
            stats: JobStats::default(),
            errors: Vec::new(),
            fatal: Some(error.to_string()),
            store_corrupt,
        }
    }

    fn finish(&self, handle: &SnapshotHandle) -> Result<(), BackupError> {
        let records = self.catalog.list_files(&handle.id)?;
        let root = merkle::build_and_persist(self.catalog.as_ref(), Arc::clone(&self.hasher), &records)?;
        let snapshot = self.catalog.commit(handle, root)?;
        log::info!(
            "snapshot {} committed: {} files, {}",
            snapshot.id,
            snapshot.total_files,
            bytesize::ByteSize(snapshot.total_bytes)
        );
        Ok(())
    }

    fn scan(&self, source_root: &Path, options: &BackupOptions) -> Result<Vec<ScanEntry>, BackupError> {
        let mut entries = Vec::new();
        let follow_links = options.symlink_strategy == SymlinkStrategy::Follow;
        let mut walker = WalkDir::new(source_root)
            .sort_by_file_name()
            .follow_links(follow_links);
        if let Some(max_depth) = options.max_depth {
            walker = walker.max_depth(max_depth);
        }

        for entry in walker {
            let entry = entry?;
            if entry.depth() == 0 {
                continue;
            }
            let relative_path = entry
                .path()
                .strip_prefix(source_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            if !options.include_hidden && is_hidden(&relative_path) {
                continue;
            }

            if entry.file_type().is_dir() {
                entries.push(ScanEntry {
                    relative_path,
                    absolute_path: entry.path().to_path_buf(),
                    file_type: FileType::Directory,
                    symlink_target: None,
                });
                continue;
            }

            if entry.path_is_symlink() {
                match options.symlink_strategy {
                    SymlinkStrategy::Skip => continue,
                    SymlinkStrategy::Record => {
                        let target = fs::read_link(entry.path())?;
                        entries.push(ScanEntry {
                            relative_path,
                            absolute_path: entry.path().to_path_buf(),
                            file_type: FileType::Symlink,
                            symlink_target: Some(target.to_string_lossy().to_string()),
                        });
                        continue;
                    }
                    SymlinkStrategy::Follow => {} // fall through, treated as a regular file
                }
            }

            entries.push(ScanEntry {
                relative_path,
                absolute_path: entry.path().to_path_buf(),
                file_type: FileType::Regular,
                symlink_target: None,
            });
        }
        Ok(entries)
    }

    /// Processes every entry, in parallel up to `options.worker_threads`.
    /// Per-file failures are counted, not fatal to the job.
    fn process_all(
        &self,
        entries: &[ScanEntry],
        options: &BackupOptions,
        progress: &dyn ProgressSink,
    ) -> (Vec<FileRecord>, JobStats, Vec<String>) {
        let zero_cache = Mutex::new(ZeroSentinelCache::new());
        let num_threads = options.worker_threads.unwrap_or_else(num_cpus::get);
        let run = || {
            entries
                .par_iter()
                .map(|entry| {
                    progress.on_file_start(&entry.relative_path);
                    self.process_one(entry, options, &zero_cache)
                        .map_err(|e| (entry.relative_path.clone(), e.to_string()))
                })
                .collect::<Vec<Result<(FileRecord, u64, u64, u64), (String, String)>>>()
        };
        let results = match rayon::ThreadPoolBuilder::new().num_threads(num_threads).build() {
            Ok(pool) => pool.install(run),
            Err(_) => run(),
        };

        let mut records = Vec::with_capacity(results.len());
        let mut stats = JobStats::default();
        let mut errors = Vec::new();

        for result in results {
            match result {
                Ok((record, bytes, new, shared)) => {
                    if record.file_type != FileType::Directory {
                        progress.on_file_processed(&record.relative_path, bytes);
                        stats.files_processed += 1;
                        stats.bytes_processed += bytes;
                        stats.chunks_new += new;
                        stats.chunks_shared += shared;
                    }
                    records.push(record);
                }
                Err((path, message)) => {
                    progress.on_file_error(&path, &message);
                    errors.push(format!("{path}: {message}"));
                }
            }
        }
        (records, stats, errors)
    }

    fn process_one(
        &self,
        entry: &ScanEntry,
        options: &BackupOptions,
        zero_cache: &Mutex<ZeroSentinelCache>,
    ) -> Result<(FileRecord, u64, u64, u64), BackupError> {
        if entry.file_type == FileType::Symlink {
            let target = entry.symlink_target.clone().unwrap_or_default();
            let hash = self.hasher.hash(target.as_bytes());
            let record = FileRecord {
                relative_path: entry.relative_path.clone(),
                size: 0,
                mtime_seconds: 0,
                mtime_nanos: 0,
                mode: 0,
                file_type: FileType::Symlink,
                symlink_target: entry.symlink_target.clone(),
                chunks: Vec::new(),
                chunking_mode: options.chunking_mode,
                file_hash: hash,
            };
            return Ok((record, 0, 0, 0));
        }

        if entry.file_type == FileType::Directory {
            let metadata = fs::metadata(&entry.absolute_path).map_err(|_| BackupError::unreadable(&entry.absolute_path))?;
            #[cfg(unix)]
            let mode = {
                use std::os::unix::fs::PermissionsExt;
                metadata.permissions().mode()
            };
            #[cfg(not(unix))]
            let mode = 0o755;
            let record = FileRecord {
                relative_path: entry.relative_path.clone(),
                size: 0,
                mtime_seconds: 0,
                mtime_nanos: 0,
                mode,
                file_type: FileType::Directory,
                symlink_target: None,
                chunks: Vec::new(),
                chunking_mode: options.chunking_mode,
                file_hash: self.hasher.hash(entry.relative_path.as_bytes()),
            };
            return Ok((record, 0, 0, 0));
        }

        let metadata = fs::metadata(&entry.absolute_path).map_err(|_| BackupError::unreadable(&entry.absolute_path))?;
        let mut file = File::open(&entry.absolute_path).map_err(|_| BackupError::unreadable(&entry.absolute_path))?;
        let bytes = chunk::read_all(&mut file)?;

        let chunker: Box<dyn Chunker> = match options.chunking_mode {
            ChunkingMode::Fixed => Box::new(FixedSizeChunker::new(options.chunk_size)?),
            ChunkingMode::Cdc => Box::new(CdcChunker::default()),
        };
        let pieces = chunker.chunk(&bytes)?;

        let mut chunk_refs = Vec::with_capacity(pieces.len());
        let mut new_chunks = 0u64;
        let mut shared_chunks = 0u64;

        for piece in &pieces {
            let hash = if chunk::is_all_zero(&piece.bytes) {
                zero_cache.lock().sentinel_for(self.hasher.as_ref(), piece.bytes.len())
            } else {
                self.hasher.hash(&piece.bytes)
            };

            if self.store.put(hash, &piece.bytes)? {
                new_chunks += 1;
            } else {
                shared_chunks += 1;
            }

            chunk_refs.push(ChunkRef {
                offset: piece.offset,
                length: piece.length,
                chunk_hash: hash,
            });
        }

        let size = bytes.len() as u64;
        let file_hash = merkle::file_hash(self.hasher.as_ref(), size, &chunk_refs);
        let mtime = metadata.modified().ok();
        let (mtime_seconds, mtime_nanos) = mtime
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| (d.as_secs() as i64, d.subsec_nanos()))
            .unwrap_or((0, 0));

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = 0o644;

        let record = FileRecord {
            relative_path: entry.relative_path.clone(),
            size,
            mtime_seconds,
            mtime_nanos,
            mode,
            file_type: FileType::Regular,
            symlink_target: None,
            chunks: chunk_refs,
            chunking_mode: options.chunking_mode,
            file_hash,
        };

        Ok((record, size, new_chunks, shared_chunks))
    }
}

fn is_hidden(relative_path: &str) -> bool {
    relative_path
        .split('/')
        .any(|segment| segment.starts_with('.') && segment != "." && segment != "..")
}
