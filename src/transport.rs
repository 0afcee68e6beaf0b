//! Remote chunk transport: the abstraction a networked CAS backend
//! would implement. No transport ships with this crate (§1, §6); the
//! trait exists so the Backup/Restore Coordinators can be driven
//! against a store whose chunks aren't local without changing their
//! code.

use crate::error::BackupError;
use crate::hash::ChunkHash;

/// Bit-exact with `ChunkStore`'s contract; a future networked store
/// implements this directly or adapts into a `ChunkStore`.
pub trait ChunkTransport: Send + Sync {
    fn put(&self, hash: ChunkHash, bytes: &[u8]) -> Result<(), BackupError>;
    fn get(&self, hash: ChunkHash) -> Result<Vec<u8>, BackupError>;
    fn exists(&self, hash: ChunkHash) -> Result<bool, BackupError>;
}
