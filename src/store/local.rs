use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::BackupError;
use crate::hash::{ChunkHash, Hasher};

use super::ChunkStore;

/// Directory layout trading directory fan-out against traversal cost.
/// The spec fixes only the `hash -> opaque locator` mapping, not the
/// format, so all three are interchangeable on an existing store as
/// long as the configuration records which one is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutStrategy {
    /// `<root>/<hash>`
    Flat,
    /// `<root>/<hh>/<hash>`, `hh` is the first hex byte.
    SinglePrefix,
    /// `<root>/<hh>/<hh2>/<hash>`, default.
    TwoPrefix,
}

impl LayoutStrategy {
    pub fn locator(&self, root: &Path, hash: ChunkHash) -> PathBuf {
        let hex = hash.to_hex();
        match self {
            LayoutStrategy::Flat => root.join(&hex),
            LayoutStrategy::SinglePrefix => root.join(&hex[..2]).join(&hex),
            LayoutStrategy::TwoPrefix => root.join(&hex[..2]).join(&hex[2..4]).join(&hex),
        }
    }
}

/// A small stripe of mutexes keyed by hash, so concurrent `put`s for
/// the same hash collapse to one physical write while puts/gets for
/// different hashes proceed in parallel. 256 stripes keeps contention
/// low without one lock per hash.
struct HashLockStripe {
    locks: Vec<Mutex<()>>,
}

impl HashLockStripe {
    fn new() -> Self {
        Self {
            locks: (0..256).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, hash: ChunkHash) -> parking_lot::MutexGuard<'_, ()> {
        let idx = hash.as_bytes()[0] as usize % self.locks.len();
        self.locks[idx].lock()
    }
}

/// Filesystem-backed chunk store. Writes are atomic: bytes land in a
/// sibling temp file first and are renamed into place only once fully
/// durable, so a reader never observes a partial chunk.
pub struct LocalChunkStore {
    root: PathBuf,
    quarantine_dir: PathBuf,
    layout: LayoutStrategy,
    hasher: Arc<dyn Hasher>,
    locks: HashLockStripe,
}

impl LocalChunkStore {
    pub fn open(
        root: impl Into<PathBuf>,
        layout: LayoutStrategy,
        hasher: Arc<dyn Hasher>,
    ) -> Result<Self, BackupError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let quarantine_dir = root.join(".quarantine");
        fs::create_dir_all(&quarantine_dir)?;
        Ok(Self {
            root,
            quarantine_dir,
            layout,
            hasher,
            locks: HashLockStripe::new(),
        })
    }

    fn quarantine(&self, hash: ChunkHash, path: &Path) -> Result<(), BackupError> {
        let dest = self.quarantine_dir.join(hash.to_hex());
        if path.exists() {
            fs::rename(path, dest)?;
        }
        Ok(())
    }

    fn walk_locators(&self) -> Result<Vec<PathBuf>, BackupError> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry?;
            if entry.path().starts_with(&self.quarantine_dir) {
                continue;
            }
            if entry.file_type().is_file() {
                out.push(entry.path().to_path_buf());
            }
        }
        Ok(out)
    }
}

impl ChunkStore for LocalChunkStore {
    fn put(&self, hash: ChunkHash, bytes: &[u8]) -> Result<bool, BackupError> {
        let _guard = self.locks.lock(hash);
        let path = self.layout.locator(&self.root, hash);

        if path.exists() {
            let existing = fs::read(&path)?;
            if self.hasher.hash(&existing) == hash {
                return Ok(false);
            }
            // On-disk bytes no longer match their own name: treat this
            // exactly like a corrupt read and quarantine before
            // rewriting, rather than silently trusting stale content.
            self.quarantine(hash, &path)?;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(bytes)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(true)
    }

    fn get(&self, hash: ChunkHash) -> Result<Vec<u8>, BackupError> {
        let path = self.layout.locator(&self.root, hash);
        if !path.exists() {
            return Err(BackupError::chunk_not_found(hash));
        }
        let bytes = fs::read(&path)?;
        let actual = self.hasher.hash(&bytes);
        if actual != hash {
            self.quarantine(hash, &path)?;
            return Err(BackupError::integrity(format!(
                "chunk {hash} read back as {actual}"
            )));
        }
        Ok(bytes)
    }

    fn exists(&self, hash: ChunkHash) -> Result<bool, BackupError> {
        Ok(self.layout.locator(&self.root, hash).exists())
    }

    fn sweep(&self, live_set: &HashSet<ChunkHash>) -> Result<u64, BackupError> {
        let mut deleted = 0u64;
        for path in self.walk_locators()? {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(hash) = file_name.parse::<ChunkHash>() else {
                continue;
            };
            if live_set.contains(&hash) {
                continue;
            }
            // Re-take the per-hash lock so we never race a concurrent
            // put that just created this exact chunk.
            let _guard = self.locks.lock(hash);
            if path.exists() && !live_set.contains(&hash) {
                fs::remove_file(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn size(&self) -> Result<(u64, u64), BackupError> {
        let mut count = 0u64;
        let mut bytes = 0u64;
        for path in self.walk_locators()? {
            if path.file_name().and_then(|n| n.to_str()).is_some() {
                count += 1;
                bytes += fs::metadata(&path)?.len();
            }
        }
        Ok((count, bytes))
    }
}
