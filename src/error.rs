//! Errors for the strata library
//!
//! Enumeration for all errors that can occur across the chunking,
//! storage, catalog and restore pipelines.

use derive_more::{Display, Error};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Wraps a string so it can act as the payload of an error variant.
#[derive(Debug)]
pub struct StringError(String);

impl From<&str> for StringError {
    fn from(s: &str) -> Self {
        StringError(s.to_string())
    }
}

impl From<String> for StringError {
    fn from(s: String) -> Self {
        StringError(s)
    }
}

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StringError {}

/// Wraps a path so it can act as the payload of an error variant.
#[derive(Debug)]
pub struct PathBufError(PathBuf);

impl From<&Path> for PathBufError {
    fn from(p: &Path) -> Self {
        PathBufError(p.to_path_buf())
    }
}

impl From<PathBuf> for PathBufError {
    fn from(p: PathBuf) -> Self {
        PathBufError(p)
    }
}

impl fmt::Display for PathBufError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl std::error::Error for PathBufError {}

#[derive(Debug, Display, Error)]
pub enum BackupError {
    // Input
    InvalidSource(PathBufError),
    SnapshotNotFound(StringError),
    SnapshotNotCommitted(StringError),
    TargetNotEmpty(PathBufError),
    Unreadable(PathBufError),

    // Integrity
    Integrity(StringError),
    ChunkNotFound(StringError),
    RestoreVerification(PathBufError),
    DanglingReference(StringError),

    // Catalog invariants
    CatalogInvariant(StringError),

    // Internal / programming errors
    Internal(StringError),

    // External library errors
    IO(io::Error),
    SQL(rusqlite::Error),
    JSON(serde_json::Error),
    WalkDir(walkdir::Error),

    // Fallback
    Basic(StringError),
}

impl BackupError {
    pub fn basic_str(s: impl AsRef<str>) -> Self {
        BackupError::Basic(StringError::from(s.as_ref()))
    }

    pub fn invalid_source(path: impl AsRef<Path>) -> Self {
        BackupError::InvalidSource(PathBufError::from(path.as_ref()))
    }

    pub fn snapshot_not_found(id: impl AsRef<str>) -> Self {
        BackupError::SnapshotNotFound(StringError::from(id.as_ref()))
    }

    pub fn snapshot_not_committed(id: impl AsRef<str>) -> Self {
        BackupError::SnapshotNotCommitted(StringError::from(id.as_ref()))
    }

    pub fn target_not_empty(path: impl AsRef<Path>) -> Self {
        BackupError::TargetNotEmpty(PathBufError::from(path.as_ref()))
    }

    pub fn unreadable(path: impl AsRef<Path>) -> Self {
        BackupError::Unreadable(PathBufError::from(path.as_ref()))
    }

    pub fn integrity(msg: impl AsRef<str>) -> Self {
        BackupError::Integrity(StringError::from(msg.as_ref()))
    }

    pub fn chunk_not_found(hash: impl fmt::Display) -> Self {
        BackupError::ChunkNotFound(StringError::from(hash.to_string()))
    }

    pub fn restore_verification(path: impl AsRef<Path>) -> Self {
        BackupError::RestoreVerification(PathBufError::from(path.as_ref()))
    }

    pub fn dangling_reference(path: impl AsRef<Path>, hash: impl fmt::Display) -> Self {
        BackupError::DanglingReference(StringError::from(format!(
            "{} -> {}",
            path.as_ref().to_string_lossy(),
            hash
        )))
    }

    pub fn catalog_invariant(msg: impl AsRef<str>) -> Self {
        BackupError::CatalogInvariant(StringError::from(msg.as_ref()))
    }

    pub fn internal(msg: impl AsRef<str>) -> Self {
        BackupError::Internal(StringError::from(msg.as_ref()))
    }

    /// Whether this error represents a fatal, store-level corruption
    /// rather than a per-file problem that a job can tolerate.
    pub fn is_store_fatal(&self) -> bool {
        matches!(self, BackupError::SQL(_) | BackupError::CatalogInvariant(_))
    }
}


impl From<io::Error> for BackupError {
    fn from(value: io::Error) -> Self {
        BackupError::IO(value)
    }
}

impl From<rusqlite::Error> for BackupError {
    fn from(value: rusqlite::Error) -> Self {
        BackupError::SQL(value)
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(value: serde_json::Error) -> Self {
        BackupError::JSON(value)
    }
}

impl From<walkdir::Error> for BackupError {
    fn from(value: walkdir::Error) -> Self {
        BackupError::WalkDir(value)
    }
}
