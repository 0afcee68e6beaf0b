//! Content-addressable chunk store (CAS).
//!
//! Maps `chunk_hash -> bytes`; deduplicating, append-only, with
//! reference-sweep garbage collection. Transform wrappers (compress,
//! encrypt) decorate any `ChunkStore` without changing its contract.

mod local;
mod transform;

pub use local::{LayoutStrategy, LocalChunkStore};
pub use transform::{CompressingStore, DeterministicEncryptingStore};

use std::collections::HashSet;

use crate::error::BackupError;
use crate::hash::ChunkHash;

/// Contract every chunk store backend implements.
pub trait ChunkStore: Send + Sync {
    /// Store `bytes` under their content hash. Idempotent: re-putting
    /// bytes that already resolve to a stored chunk is a no-op after
    /// an integrity check confirms the bytes already on disk still
    /// hash to `hash` — a chunk corrupted since its original write is
    /// caught and quarantined here rather than left for the next `get`
    /// to stumble on. Returns `true` iff this call wrote a chunk that
    /// wasn't already present — the exists-check and the write happen
    /// under the same per-hash lock so concurrent puts of the same new
    /// chunk are counted exactly once.
    fn put(&self, hash: ChunkHash, bytes: &[u8]) -> Result<bool, BackupError>;

    /// Fetch bytes for `hash`, verifying `H(bytes) == hash` before
    /// returning them. A mismatch is an `Integrity` error; the chunk
    /// is quarantined rather than deleted.
    fn get(&self, hash: ChunkHash) -> Result<Vec<u8>, BackupError>;

    fn exists(&self, hash: ChunkHash) -> Result<bool, BackupError>;

    /// Delete every stored chunk not present in `live_set`. Returns
    /// the number of chunks deleted. Safe to interrupt and re-run.
    fn sweep(&self, live_set: &HashSet<ChunkHash>) -> Result<u64, BackupError>;

    /// Total number of chunks and bytes currently stored, used for
    /// reporting and the "CAS size grows by 0" idempotence test.
    fn size(&self) -> Result<(u64, u64), BackupError>;
}
