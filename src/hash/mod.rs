//! Cryptographic hashing for chunk identity and Merkle node composition.
//!
//! A single algorithm (SHA-256) is wired in today, but callers see only
//! the `Hasher` trait so a store's configuration can record which
//! algorithm produced its hashes and tests can substitute a fake.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::BackupError;

/// A 256-bit content hash, serialized as lowercase hex for catalog
/// storage and compared as raw bytes everywhere else.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkHash([u8; 32]);

impl ChunkHash {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ChunkHash {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s)
            .map_err(|e| BackupError::basic_str(format!("invalid hex hash {s:?}: {e}")))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| BackupError::basic_str(format!("hash {s:?} is not 32 bytes")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", self.to_hex())
    }
}

/// Incremental hashing state, started once per chunk/node and fed
/// bytes via `update` regardless of how the caller chooses to split
/// them up — the result never depends on the update boundaries.
pub struct HashState(Sha256);

/// Contract every hashing algorithm implements: a one-shot `hash`, and
/// an incremental `start`/`update`/`finish` form for streaming input.
pub trait Hasher: Send + Sync {
    fn start(&self) -> HashState;
    fn update(&self, state: &mut HashState, bytes: &[u8]);
    fn finish(&self, state: HashState) -> ChunkHash;

    fn hash(&self, bytes: &[u8]) -> ChunkHash {
        let mut state = self.start();
        self.update(&mut state, bytes);
        self.finish(state)
    }

    /// Identifier recorded in store configuration; changing algorithms
    /// requires a new store.
    fn algorithm_name(&self) -> &'static str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    fn start(&self) -> HashState {
        HashState(Sha256::new())
    }

    fn update(&self, state: &mut HashState, bytes: &[u8]) {
        state.0.update(bytes);
    }

    fn finish(&self, state: HashState) -> ChunkHash {
        let digest = state.0.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        ChunkHash::new(out)
    }

    fn algorithm_name(&self) -> &'static str {
        "sha256"
    }
}

/// Hash of `count` zero bytes, used by the chunker's sparse-file
/// sentinel. Cached per-length by callers; cheap enough to recompute
/// since it never reads the file.
pub fn hash_zero_run(hasher: &dyn Hasher, count: usize) -> ChunkHash {
    let zeros = vec![0u8; count];
    hasher.hash(&zeros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_regardless_of_update_boundaries() {
        let hasher = Sha256Hasher;
        let whole = hasher.hash(b"hello world");

        let mut state = hasher.start();
        hasher.update(&mut state, b"hello ");
        hasher.update(&mut state, b"world");
        let split = hasher.finish(state);

        assert_eq!(whole, split);
    }

    #[test]
    fn hex_round_trip() {
        let hasher = Sha256Hasher;
        let hash = hasher.hash(b"round trip me");
        let hex = hash.to_hex();
        let parsed: ChunkHash = hex.parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn different_bytes_different_hash() {
        let hasher = Sha256Hasher;
        assert_ne!(hasher.hash(b"a"), hasher.hash(b"b"));
    }
}
