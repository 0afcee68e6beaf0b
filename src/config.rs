//! Construction-time configuration for the Backup and Restore
//! Coordinators and the Chunk Store. No global state: every knob is a
//! field threaded in by the caller (§6).

use crate::model::ChunkingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkStrategy {
    /// Treat the link target's contents as the file's content.
    Follow,
    /// Persist the link target string only, no content is chunked.
    Record,
    /// Omit symlinks from the snapshot entirely.
    Skip,
}

impl Default for SymlinkStrategy {
    fn default() -> Self {
        SymlinkStrategy::Record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    None,
    /// Deterministic AES-256-GCM; the 32-byte key is supplied by the
    /// caller (e.g. read from an external keychain), never generated
    /// or persisted by this crate.
    AesGcmDeterministic { key: [u8; 32] },
}

impl Default for Encryption {
    fn default() -> Self {
        Encryption::None
    }
}

/// Options governing a single backup job.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub symlink_strategy: SymlinkStrategy,
    pub include_hidden: bool,
    pub chunk_size: usize,
    pub chunking_mode: ChunkingMode,
    pub max_depth: Option<usize>,
    pub verify_integrity: bool,
    pub snapshot_name: Option<String>,
    pub description: Option<String>,
    pub worker_threads: Option<usize>,
    pub max_in_flight_chunks: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            symlink_strategy: SymlinkStrategy::default(),
            include_hidden: false,
            chunk_size: crate::constants::DEFAULT_CHUNK_SIZE,
            chunking_mode: ChunkingMode::Cdc,
            max_depth: None,
            verify_integrity: true,
            snapshot_name: None,
            description: None,
            worker_threads: None,
            max_in_flight_chunks: 64,
        }
    }
}

/// Options governing a single restore job.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub overwrite: bool,
    pub backup_existing: bool,
    pub no_verify: bool,
    pub no_preserve_attributes: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub max_chunk_retries: u32,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            backup_existing: false,
            no_verify: false,
            no_preserve_attributes: false,
            include: Vec::new(),
            exclude: Vec::new(),
            max_chunk_retries: 3,
        }
    }
}

/// Store-level configuration, fixed at creation and recorded for
/// later opens.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub compression: Compression,
    pub encryption: Encryption,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            encryption: Encryption::default(),
        }
    }
}

/// Outcome of a completed (or failed) job: counts plus the first N
/// per-file error details. Mapping this to a process exit code is a
/// CLI's job, not this crate's (§6).
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub snapshot_id: Option<String>,
    pub stats: crate::model::JobStats,
    pub errors: Vec<String>,
    pub fatal: Option<String>,
    /// True when `fatal` is a store-level failure (catalog corruption,
    /// a broken invariant) rather than an I/O problem a retry might
    /// clear. A CLI wrapper can map this to a distinct exit code.
    pub store_corrupt: bool,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }
}
