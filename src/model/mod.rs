//! Core data model: chunks, file records, snapshots and merkle nodes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::hash::ChunkHash;

/// An ordered reference to one physical chunk within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub offset: u64,
    pub length: u64,
    pub chunk_hash: ChunkHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkingMode {
    Fixed,
    Cdc,
}

impl ChunkingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkingMode::Fixed => "fixed",
            ChunkingMode::Cdc => "cdc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Regular => "regular",
            FileType::Directory => "dir",
            FileType::Symlink => "symlink",
        }
    }
}

/// A snapshot-scoped record of one file (or directory, or symlink) and
/// its ordered chunk references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub relative_path: String,
    pub size: u64,
    pub mtime_seconds: i64,
    pub mtime_nanos: u32,
    pub mode: u32,
    pub file_type: FileType,
    /// Present for symlinks when `symlink_strategy=record`.
    pub symlink_target: Option<String>,
    pub chunks: Vec<ChunkRef>,
    pub chunking_mode: ChunkingMode,
    /// Merkle hash of (chunks + metadata); see `merkle::file_hash`.
    pub file_hash: ChunkHash,
}

impl FileRecord {
    /// Σ chunk lengths, used to validate the `size = Σ chunks[i].length`
    /// invariant at append time.
    pub fn chunk_length_sum(&self) -> u64 {
        self.chunks.iter().map(|c| c.length).sum()
    }
}

/// An immutable, named set of FileRecords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub description: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub source_root: String,
    pub root_merkle_hash: Option<ChunkHash>,
    pub total_files: u64,
    pub total_bytes: u64,
    pub parent_snapshot_id: Option<String>,
    pub committed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MerkleNodeKind {
    File,
    Dir,
}

/// A hash-addressed node summarizing a subtree: for FILE nodes the
/// hash is the precomputed `FileRecord::file_hash`; for DIR nodes it
/// is derived from the sorted child hashes (see `merkle::build`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub hash: ChunkHash,
    pub kind: MerkleNodeKind,
    pub name: String,
    pub size: u64,
    pub children: Vec<MerkleChild>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleChild {
    pub name: String,
    pub kind: MerkleNodeKind,
    pub hash: ChunkHash,
}

/// Aggregate counters a backup job reports; §3 supplemental fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub files_processed: u64,
    pub files_errored: u64,
    pub files_skipped: u64,
    pub bytes_processed: u64,
    pub chunks_new: u64,
    pub chunks_shared: u64,
}

impl JobStats {
    /// Ratio reported by §8 S2: total chunk references over new chunks
    /// written. 1.0 when nothing was deduplicated.
    pub fn dedup_ratio(&self) -> f64 {
        let total_refs = self.chunks_new + self.chunks_shared;
        if self.chunks_new == 0 {
            if total_refs == 0 {
                1.0
            } else {
                total_refs as f64
            }
        } else {
            total_refs as f64 / self.chunks_new as f64
        }
    }
}

/// Catalog-wide stats, see `Catalog::stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogStats {
    pub snapshot_count: u64,
    pub committed_snapshot_count: u64,
    pub data_type_sizes: HashMap<String, u64>,
}
