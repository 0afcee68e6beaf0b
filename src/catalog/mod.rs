//! Metadata Catalog: the durable record of snapshots, files and
//! chunk references. Backed by SQLite so `commit` and
//! `delete_snapshot` are single ACID transactions and `copy_unchanged`
//! can be a bulk insert-from-select rather than a copy of chunk bytes.

mod schema;
mod sqlite;

pub use sqlite::SqliteCatalog;

use std::collections::HashSet;

use crate::error::BackupError;
use crate::hash::ChunkHash;
use crate::model::{CatalogStats, FileRecord, Snapshot};

/// An uncommitted snapshot a Backup Coordinator is actively
/// populating. Opaque to callers beyond the id it wraps.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    pub id: String,
}

/// Contract the Metadata Catalog implements (§4.4).
pub trait Catalog: Send + Sync {
    fn create_snapshot(
        &self,
        id: &str,
        description: &str,
        source_root: &str,
        parent: Option<&str>,
    ) -> Result<SnapshotHandle, BackupError>;

    /// Idempotent per path within a snapshot: a second append for the
    /// same `relative_path` replaces the first.
    fn append_file(&self, handle: &SnapshotHandle, record: &FileRecord) -> Result<(), BackupError>;

    /// Copies every FileRecord (and its chunk references) from `from`
    /// to `to` except paths in `changed_paths`. Only references are
    /// duplicated, never chunk bytes.
    fn copy_unchanged(
        &self,
        from: &str,
        to: &SnapshotHandle,
        changed_paths: &HashSet<String>,
    ) -> Result<u64, BackupError>;

    /// Atomically finalizes `root_merkle_hash` and the aggregate
    /// totals, then marks the snapshot committed.
    fn commit(&self, handle: &SnapshotHandle, root_merkle_hash: ChunkHash) -> Result<Snapshot, BackupError>;

    fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>, BackupError>;

    /// Only committed snapshots are listed.
    fn list_snapshots(&self) -> Result<Vec<Snapshot>, BackupError>;

    fn list_files(&self, snapshot_id: &str) -> Result<Vec<FileRecord>, BackupError>;

    /// Removes a snapshot and its file rows in one transaction; never
    /// leaves orphan file rows.
    fn delete_snapshot(&self, id: &str) -> Result<(), BackupError>;

    fn upsert_merkle_node(&self, node: &crate::model::MerkleNode) -> Result<(), BackupError>;

    fn get_merkle_node(&self, hash: ChunkHash) -> Result<Option<crate::model::MerkleNode>, BackupError>;

    /// Union of every `chunks[].chunk_hash` across every snapshot in
    /// the index; the CAS sweep's live set.
    fn live_chunk_hashes(&self) -> Result<HashSet<ChunkHash>, BackupError>;

    fn stats(&self) -> Result<CatalogStats, BackupError>;
}
