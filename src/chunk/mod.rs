//! Turns a byte stream into a sequence of `(offset, length, bytes)`
//! triples such that concatenating the bytes reproduces the input
//! exactly and offsets partition `[0, total_length)`.
//!
//! Two modes are supported; the mode is chosen per-file and recorded
//! on the `FileRecord` so a later diff or restore never needs to guess
//! how a file was split.

use std::collections::HashMap;
use std::io::Read;

use fastcdc::v2020::FastCDC;

use crate::constants::{CDC_MAX_CHUNK_SIZE, CDC_MIN_CHUNK_SIZE, DEFAULT_CHUNK_SIZE};
use crate::error::BackupError;
use crate::hash::{hash_zero_run, ChunkHash, Hasher};
use crate::model::ChunkingMode;

/// One content-defined or fixed-size slice of a file's bytes.
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub offset: u64,
    pub length: u64,
    pub bytes: Vec<u8>,
}

/// Contract every chunking strategy implements. Implementations are
/// lazy, finite and non-restartable: a `Chunker` is driven once per
/// file by the Backup Coordinator.
pub trait Chunker {
    fn mode(&self) -> ChunkingMode;

    /// Split `data` into ordered, contiguous pieces.
    fn chunk(&self, data: &[u8]) -> Result<Vec<ChunkPiece>, BackupError>;
}

/// Fixed-size chunker: every piece is `chunk_size` bytes except the
/// last, which may be shorter. A `chunk_size` of zero is rejected at
/// construction since it cannot make progress.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeChunker {
    chunk_size: usize,
}

impl FixedSizeChunker {
    pub fn new(chunk_size: usize) -> Result<Self, BackupError> {
        if chunk_size == 0 {
            return Err(BackupError::basic_str("chunk_size must be greater than zero"));
        }
        Ok(Self { chunk_size })
    }
}

impl Default for FixedSizeChunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE).expect("DEFAULT_CHUNK_SIZE is nonzero")
    }
}

impl Chunker for FixedSizeChunker {
    fn mode(&self) -> ChunkingMode {
        ChunkingMode::Fixed
    }

    fn chunk(&self, data: &[u8]) -> Result<Vec<ChunkPiece>, BackupError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut pieces = Vec::with_capacity(data.len() / self.chunk_size + 1);
        let mut offset = 0u64;
        for window in data.chunks(self.chunk_size) {
            pieces.push(ChunkPiece {
                offset,
                length: window.len() as u64,
                bytes: window.to_vec(),
            });
            offset += window.len() as u64;
        }
        Ok(pieces)
    }
}

/// Content-defined chunker (FastCDC): boundaries are chosen by a
/// rolling hash so that inserting or deleting bytes in the middle of
/// a file only disturbs the chunks adjacent to the edit, which is
/// what makes deduplication effective on mutable files.
#[derive(Debug, Clone, Copy)]
pub struct CdcChunker {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

impl CdcChunker {
    pub fn new(min_size: u32, avg_size: u32, max_size: u32) -> Result<Self, BackupError> {
        if !(min_size > 0 && min_size <= avg_size && avg_size <= max_size) {
            return Err(BackupError::basic_str(
                "CDC chunk sizes must satisfy 0 < min <= avg <= max",
            ));
        }
        Ok(Self {
            min_size,
            avg_size,
            max_size,
        })
    }
}

impl Default for CdcChunker {
    fn default() -> Self {
        Self::new(CDC_MIN_CHUNK_SIZE, DEFAULT_CHUNK_SIZE as u32, CDC_MAX_CHUNK_SIZE)
            .expect("default CDC parameters are valid")
    }
}

impl Chunker for CdcChunker {
    fn mode(&self) -> ChunkingMode {
        ChunkingMode::Cdc
    }

    fn chunk(&self, data: &[u8]) -> Result<Vec<ChunkPiece>, BackupError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let cutter = FastCDC::new(data, self.min_size, self.avg_size, self.max_size);
        let mut pieces = Vec::new();
        for cut in cutter {
            let offset = cut.offset as u64;
            let length = cut.length as u64;
            pieces.push(ChunkPiece {
                offset,
                length,
                bytes: data[cut.offset..cut.offset + cut.length].to_vec(),
            });
        }
        Ok(pieces)
    }
}

/// Reads an entire readable stream into memory. Both chunkers above
/// operate on a fully-buffered slice (the CDC algorithm inherently
/// needs random access to look ahead for its cut points); large
/// sparse or huge files are outside what this core optimizes for, the
/// caller decides the read strategy.
pub fn read_all(reader: &mut dyn Read) -> Result<Vec<u8>, BackupError> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Per-job cache of zero-run sentinel hashes, so a file with long
/// runs of zero bytes does not re-hash (or re-store) the same
/// all-zero chunk contents over and over.
#[derive(Default)]
pub struct ZeroSentinelCache {
    cache: HashMap<usize, ChunkHash>,
}

impl ZeroSentinelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Some(hash)` without touching `hasher` again if this
    /// exact zero-run length was already seen this job.
    pub fn sentinel_for(&mut self, hasher: &dyn Hasher, length: usize) -> ChunkHash {
        *self
            .cache
            .entry(length)
            .or_insert_with(|| hash_zero_run(hasher, length))
    }
}

/// Whether a chunk's bytes are entirely zero, i.e. eligible for the
/// sparse-file sentinel optimization.
pub fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Sha256Hasher;

    #[test]
    fn fixed_size_chunker_splits_and_reconstructs() {
        let chunker = FixedSizeChunker::new(4).unwrap();
        let data = b"hello"; // 5 bytes -> [4, 1]
        let pieces = chunker.chunk(data).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].length, 4);
        assert_eq!(pieces[1].length, 1);

        let mut reconstructed = Vec::new();
        for piece in &pieces {
            reconstructed.extend_from_slice(&piece.bytes);
        }
        assert_eq!(reconstructed, data);
    }

    #[test]
    fn fixed_size_chunker_rejects_zero_size() {
        assert!(FixedSizeChunker::new(0).is_err());
    }

    #[test]
    fn fixed_size_empty_input_yields_no_chunks() {
        let chunker = FixedSizeChunker::new(4).unwrap();
        assert!(chunker.chunk(&[]).unwrap().is_empty());
    }

    #[test]
    fn cdc_chunker_reconstructs_exactly() {
        let chunker = CdcChunker::new(64, 256, 1024).unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let pieces = chunker.chunk(&data).unwrap();

        let mut reconstructed = Vec::new();
        let mut expected_offset = 0u64;
        for piece in &pieces {
            assert_eq!(piece.offset, expected_offset);
            reconstructed.extend_from_slice(&piece.bytes);
            expected_offset += piece.length;
        }
        assert_eq!(reconstructed, data);
    }

    #[test]
    fn cdc_boundaries_are_stable_under_prefix_insertion() {
        // Inserting bytes at the front of a file should only disturb
        // the first chunk or two; the tail chunks' hashes should
        // reappear, which is the entire point of content-defined
        // chunking for dedup.
        let chunker = CdcChunker::new(64, 256, 1024).unwrap();
        let tail: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();

        let mut original = Vec::new();
        original.extend_from_slice(&tail);

        let mut modified = vec![9u8; 37];
        modified.extend_from_slice(&tail);

        let hasher = Sha256Hasher;
        let original_hashes: std::collections::HashSet<_> = chunker
            .chunk(&original)
            .unwrap()
            .iter()
            .map(|p| hasher.hash(&p.bytes))
            .collect();
        let modified_hashes: std::collections::HashSet<_> = chunker
            .chunk(&modified)
            .unwrap()
            .iter()
            .map(|p| hasher.hash(&p.bytes))
            .collect();

        let shared = original_hashes.intersection(&modified_hashes).count();
        assert!(shared > 0, "expected at least one shared chunk hash");
    }

    #[test]
    fn zero_sentinel_cache_is_stable_and_reuses() {
        let hasher = Sha256Hasher;
        let mut cache = ZeroSentinelCache::new();
        let a = cache.sentinel_for(&hasher, 4096);
        let b = cache.sentinel_for(&hasher, 4096);
        assert_eq!(a, b);
        assert!(is_all_zero(&vec![0u8; 4096]));
    }
}
