use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::BackupError;
use crate::hash::ChunkHash;

use super::ChunkStore;

/// Decorator that gzip-compresses bytes before they reach the
/// wrapped store and decompresses them on the way out. The hash a
/// caller passes in and gets back is always the hash of the
/// *plaintext* chunk — compression is purely an at-rest transform and
/// never changes chunk identity.
pub struct CompressingStore<S: ChunkStore> {
    inner: S,
    level: Compression,
}

impl<S: ChunkStore> CompressingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            level: Compression::default(),
        }
    }
}

impl<S: ChunkStore> ChunkStore for CompressingStore<S> {
    fn put(&self, hash: ChunkHash, bytes: &[u8]) -> Result<bool, BackupError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(bytes)?;
        let compressed = encoder.finish()?;
        self.inner.put(hash, &compressed)
    }

    fn get(&self, hash: ChunkHash) -> Result<Vec<u8>, BackupError> {
        let compressed = self.inner.get(hash)?;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain)?;
        Ok(plain)
    }

    fn exists(&self, hash: ChunkHash) -> Result<bool, BackupError> {
        self.inner.exists(hash)
    }

    fn sweep(&self, live_set: &HashSet<ChunkHash>) -> Result<u64, BackupError> {
        self.inner.sweep(live_set)
    }

    fn size(&self) -> Result<(u64, u64), BackupError> {
        self.inner.size()
    }
}

/// Decorator that encrypts bytes with AES-256-GCM before they reach
/// the wrapped store. Encryption is deterministic: the nonce is
/// derived from a keyed hash of the plaintext (the cipher's own key
/// material folded in alongside the bytes) rather than drawn from a
/// random source, so identical plaintext under the same key always
/// produces identical ciphertext — preserving cross-file
/// deduplication, which a random-nonce scheme would destroy.
///
/// No per-file associated data is bound to the ciphertext: binding AAD
/// would make the same plaintext chunk encrypt differently depending
/// on which file referenced it, defeating the dedup this store exists
/// to provide.
pub struct DeterministicEncryptingStore<S: ChunkStore> {
    inner: S,
    cipher: Aes256Gcm,
    key: [u8; 32],
}

impl<S: ChunkStore> DeterministicEncryptingStore<S> {
    pub fn new(inner: S, key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self {
            inner,
            cipher,
            key: *key,
        }
    }

    /// Nonce derivation is keyed: it folds in the cipher's own key
    /// material alongside the plaintext, so the nonce a given chunk
    /// maps to can't be predicted or replayed without that key. Using
    /// the chunk's content hash instead would make the nonce a pure
    /// function of public data.
    fn nonce_for(key_material: &[u8; 32], plaintext: &[u8]) -> [u8; 12] {
        let mut hasher = Sha256::new();
        hasher.update(key_material);
        hasher.update(plaintext);
        let digest = hasher.finalize();
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest[..12]);
        nonce
    }
}

impl<S: ChunkStore> ChunkStore for DeterministicEncryptingStore<S> {
    fn put(&self, hash: ChunkHash, bytes: &[u8]) -> Result<bool, BackupError> {
        let nonce_bytes = Self::nonce_for(&self.key, bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, bytes)
            .map_err(|_| BackupError::internal("encryption failed"))?;
        let mut payload = Vec::with_capacity(12 + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        self.inner.put(hash, &payload)
    }

    fn get(&self, hash: ChunkHash) -> Result<Vec<u8>, BackupError> {
        let payload = self.inner.get(hash)?;
        if payload.len() < 12 {
            return Err(BackupError::integrity(format!(
                "chunk {hash} payload too short to contain a nonce"
            )));
        }
        let (nonce_bytes, ciphertext) = payload.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| BackupError::integrity(format!("chunk {hash} failed to decrypt")))?;
        Ok(plaintext)
    }

    fn exists(&self, hash: ChunkHash) -> Result<bool, BackupError> {
        self.inner.exists(hash)
    }

    fn sweep(&self, live_set: &HashSet<ChunkHash>) -> Result<u64, BackupError> {
        self.inner.sweep(live_set)
    }

    fn size(&self) -> Result<(u64, u64), BackupError> {
        self.inner.size()
    }
}

/// Convenience alias used by callers that hold a store behind a
/// trait object (e.g. the Backup/Restore Coordinators).
pub type SharedChunkStore = Arc<dyn ChunkStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Hasher, Sha256Hasher};
    use crate::store::{LayoutStrategy, LocalChunkStore};
    use tempfile::tempdir;

    #[test]
    fn compressing_store_round_trips() {
        let dir = tempdir().unwrap();
        let local =
            LocalChunkStore::open(dir.path(), LayoutStrategy::TwoPrefix, Arc::new(Sha256Hasher))
                .unwrap();
        let store = CompressingStore::new(local);
        let hasher = Sha256Hasher;
        let data = b"compress me please, over and over and over".repeat(20);
        let hash = hasher.hash(&data);

        store.put(hash, &data).unwrap();
        assert_eq!(store.get(hash).unwrap(), data);
    }

    #[test]
    fn encrypting_store_round_trips_and_is_deterministic() {
        let dir = tempdir().unwrap();
        let local =
            LocalChunkStore::open(dir.path(), LayoutStrategy::TwoPrefix, Arc::new(Sha256Hasher))
                .unwrap();
        let key = [7u8; 32];
        let store = DeterministicEncryptingStore::new(local, &key);
        let hasher = Sha256Hasher;
        let data = b"secret chunk contents";
        let hash = hasher.hash(data);

        store.put(hash, data).unwrap();
        assert_eq!(store.get(hash).unwrap(), data);

        // Repeating the put (same key, same plaintext) must reproduce
        // the exact same nonce, hence the exact same ciphertext bytes
        // on disk.
        let nonce_a = DeterministicEncryptingStore::<LocalChunkStore>::nonce_for(&key, data);
        let nonce_b = DeterministicEncryptingStore::<LocalChunkStore>::nonce_for(&key, data);
        assert_eq!(nonce_a, nonce_b);
    }

    #[test]
    fn encrypting_store_nonce_depends_on_the_actual_key_not_the_content_hash() {
        let hasher = Sha256Hasher;
        let data = b"secret chunk contents";
        let hash = hasher.hash(data);

        // Two different keys over the same plaintext must derive
        // different nonces. If the nonce were keyed by the public
        // content hash instead of the cipher's own key, these would
        // collide.
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];
        let nonce_a = DeterministicEncryptingStore::<LocalChunkStore>::nonce_for(&key_a, data);
        let nonce_b = DeterministicEncryptingStore::<LocalChunkStore>::nonce_for(&key_b, data);
        assert_ne!(nonce_a, nonce_b);

        // And neither nonce may equal the one that would be derived
        // from the plaintext's own content hash (the old, broken
        // behavior).
        let nonce_from_hash = DeterministicEncryptingStore::<LocalChunkStore>::nonce_for(hash.as_bytes(), data);
        assert_ne!(nonce_a, nonce_from_hash);
        assert_ne!(nonce_b, nonce_from_hash);

        // The end-to-end ciphertext stored on disk differs too: two
        // stores wrapping the same backing directory contents but
        // constructed with different keys must not produce the same
        // bytes for identical plaintext.
        let dir_a = tempdir().unwrap();
        let local_a =
            LocalChunkStore::open(dir_a.path(), LayoutStrategy::TwoPrefix, Arc::new(Sha256Hasher))
                .unwrap();
        let store_a = DeterministicEncryptingStore::new(local_a, &key_a);
        store_a.put(hash, data).unwrap();

        let dir_b = tempdir().unwrap();
        let local_b =
            LocalChunkStore::open(dir_b.path(), LayoutStrategy::TwoPrefix, Arc::new(Sha256Hasher))
                .unwrap();
        let store_b = DeterministicEncryptingStore::new(local_b, &key_b);
        store_b.put(hash, data).unwrap();

        let path_a = LayoutStrategy::TwoPrefix.locator(dir_a.path(), hash);
        let path_b = LayoutStrategy::TwoPrefix.locator(dir_b.path(), hash);
        let raw_a = std::fs::read(path_a).unwrap();
        let raw_b = std::fs::read(path_b).unwrap();
        assert_ne!(raw_a, raw_b);
    }
}
