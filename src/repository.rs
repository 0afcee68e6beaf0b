//! Binds a Chunk Store, Metadata Catalog and `StoreConfig` under one
//! on-disk root: `<root>/chunks`, `<root>/catalog.sqlite`,
//! `<root>/config.json`. A caller that only needs one piece (a bare
//! `LocalChunkStore`, a `SqliteCatalog` over a path it already
//! manages) is free to wire those directly; `Repository` exists for
//! the common case of one root directory holding an entire store.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, SqliteCatalog};
use crate::config::{Compression, Encryption, StoreConfig};
use crate::constants::{CATALOG_FILE_NAME, CHUNKS_DIR, STORE_CONFIG_FILE_NAME};
use crate::error::BackupError;
use crate::hash::{Hasher, Sha256Hasher};
use crate::store::{
    ChunkStore, CompressingStore, DeterministicEncryptingStore, LayoutStrategy, LocalChunkStore,
};

/// What a reopen must agree with. The encryption key itself is never
/// part of this: per `Encryption`'s own contract, the key is supplied
/// by the caller at every open and this crate never generates or
/// persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedStoreConfig {
    hash_algorithm: String,
    compression: CompressionKind,
    encryption: EncryptionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CompressionKind {
    None,
    Zlib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EncryptionKind {
    None,
    AesGcmDeterministic,
}

impl From<&Compression> for CompressionKind {
    fn from(c: &Compression) -> Self {
        match c {
            Compression::None => CompressionKind::None,
            Compression::Zlib => CompressionKind::Zlib,
        }
    }
}

impl From<&Encryption> for EncryptionKind {
    fn from(e: &Encryption) -> Self {
        match e {
            Encryption::None => EncryptionKind::None,
            Encryption::AesGcmDeterministic { .. } => EncryptionKind::AesGcmDeterministic,
        }
    }
}

/// A fully assembled store: chunk store (with any compression/
/// encryption transform applied), catalog and hasher, all rooted at
/// the same directory.
pub struct Repository {
    pub store: Arc<dyn ChunkStore>,
    pub catalog: Arc<dyn Catalog>,
    pub hasher: Arc<dyn Hasher>,
}

impl Repository {
    /// Creates a new store at `root`. Fails if a store config is
    /// already recorded there.
    pub fn init(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self, BackupError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let config_path = root.join(STORE_CONFIG_FILE_NAME);
        if config_path.exists() {
            return Err(BackupError::basic_str(format!(
                "a store is already initialized at {}",
                root.display()
            )));
        }

        let hasher = Arc::new(Sha256Hasher);
        let persisted = PersistedStoreConfig {
            hash_algorithm: hasher.algorithm_name().to_string(),
            compression: CompressionKind::from(&config.compression),
            encryption: EncryptionKind::from(&config.encryption),
        };
        fs::write(&config_path, serde_json::to_vec_pretty(&persisted)?)?;

        Self::assemble(root, hasher, config)
    }

    /// Opens a store previously created with `init`, validating that
    /// the hash algorithm and compression/encryption kind recorded at
    /// creation still match what `config` asks for.
    pub fn open(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self, BackupError> {
        let root = root.as_ref();
        let config_path = root.join(STORE_CONFIG_FILE_NAME);
        let raw = fs::read(&config_path)
            .map_err(|_| BackupError::basic_str(format!("no store found at {}", root.display())))?;
        let persisted: PersistedStoreConfig = serde_json::from_slice(&raw)?;

        let hasher = Arc::new(Sha256Hasher);
        if persisted.hash_algorithm != hasher.algorithm_name() {
            return Err(BackupError::catalog_invariant(format!(
                "store at {} was created with hash algorithm {:?}, this caller uses {:?}",
                root.display(),
                persisted.hash_algorithm,
                hasher.algorithm_name()
            )));
        }
        let wanted_compression = CompressionKind::from(&config.compression);
        if persisted.compression != wanted_compression {
            return Err(BackupError::catalog_invariant(format!(
                "store at {} was created with compression {:?}, this caller asked for {:?}",
                root.display(),
                persisted.compression,
                wanted_compression
            )));
        }
        let wanted_encryption = EncryptionKind::from(&config.encryption);
        if persisted.encryption != wanted_encryption {
            return Err(BackupError::catalog_invariant(format!(
                "store at {} was created with encryption {:?}, this caller asked for {:?}",
                root.display(),
                persisted.encryption,
                wanted_encryption
            )));
        }

        Self::assemble(root, hasher, config)
    }

    fn assemble(
        root: &Path,
        hasher: Arc<Sha256Hasher>,
        config: StoreConfig,
    ) -> Result<Self, BackupError> {
        let local = LocalChunkStore::open(
            root.join(CHUNKS_DIR),
            LayoutStrategy::TwoPrefix,
            hasher.clone(),
        )?;

        let store: Arc<dyn ChunkStore> = match (&config.compression, &config.encryption) {
            (Compression::None, Encryption::None) => Arc::new(local),
            (Compression::Zlib, Encryption::None) => Arc::new(CompressingStore::new(local)),
            (Compression::None, Encryption::AesGcmDeterministic { key }) => {
                Arc::new(DeterministicEncryptingStore::new(local, key))
            }
            (Compression::Zlib, Encryption::AesGcmDeterministic { key }) => {
                Arc::new(DeterministicEncryptingStore::new(
                    CompressingStore::new(local),
                    key,
                ))
            }
        };

        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::open(root.join(CATALOG_FILE_NAME))?);

        Ok(Self {
            store,
            catalog,
            hasher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_then_reopen_round_trips_configuration() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path(), StoreConfig::default()).unwrap();
        let hash = repo.hasher.hash(b"hello");
        repo.store.put(hash, b"hello").unwrap();

        let reopened = Repository::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(reopened.store.get(hash).unwrap(), b"hello");
    }

    #[test]
    fn reopen_with_mismatched_encryption_is_rejected() {
        let dir = tempdir().unwrap();
        Repository::init(dir.path(), StoreConfig::default()).unwrap();

        let mismatched = StoreConfig {
            compression: Compression::default(),
            encryption: Encryption::AesGcmDeterministic { key: [9u8; 32] },
        };
        let err = Repository::open(dir.path(), mismatched).unwrap_err();
        assert!(matches!(err, BackupError::CatalogInvariant(_)));
    }

    #[test]
    fn open_without_prior_init_fails() {
        let dir = tempdir().unwrap();
        let err = Repository::open(dir.path(), StoreConfig::default()).unwrap_err();
        assert!(matches!(err, BackupError::Basic(_)));
    }
}
