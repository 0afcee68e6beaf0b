use std::fs;
use std::sync::Arc;

use strata::backup::BackupCoordinator;
use strata::catalog::{Catalog, SqliteCatalog};
use strata::config::{BackupOptions, RestoreOptions};
use strata::detect::WalkChangeDetector;
use strata::hash::{Hasher, Sha256Hasher};
use strata::merkle::{self, empty_dir_hash, MerkleDiffer};
use strata::model::ChunkingMode;
use strata::progress::NullProgressSink;
use strata::restore::RestoreCoordinator;
use strata::store::{ChunkStore, LayoutStrategy, LocalChunkStore};
use tempfile::tempdir;

fn env() -> (Arc<dyn Catalog>, Arc<dyn ChunkStore>, Arc<dyn Hasher>, tempfile::TempDir) {
    let _ = env_logger::try_init();
    let chunks = tempdir().unwrap();
    let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::open_in_memory().unwrap());
    let hasher: Arc<dyn Hasher> = Arc::new(Sha256Hasher);
    let store: Arc<dyn ChunkStore> = Arc::new(
        LocalChunkStore::open(chunks.path(), LayoutStrategy::TwoPrefix, Arc::clone(&hasher)).unwrap(),
    );
    (catalog, store, hasher, chunks)
}

/// S1: a 5-byte file chunked at size 4 yields chunks of length 4 and 1,
/// and the CAS gains exactly two new entries.
#[test]
fn s1_fixed_chunking_splits_by_configured_size() {
    let (catalog, store, hasher, _chunks) = env();
    let source = tempdir().unwrap();
    fs::write(source.path().join("a.txt"), b"hello").unwrap();

    let backup = BackupCoordinator::new(Arc::clone(&catalog), Arc::clone(&store), Arc::clone(&hasher));
    let mut options = BackupOptions::default();
    options.chunking_mode = ChunkingMode::Fixed;
    options.chunk_size = 4;

    let outcome = backup.run_full(source.path(), &options, &NullProgressSink).unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.stats.chunks_new, 2);

    let snapshot_id = outcome.snapshot_id.unwrap();
    let files = catalog.list_files(&snapshot_id).unwrap();
    assert_eq!(files.len(), 1);
    let record = &files[0];
    assert_eq!(record.size, 5);
    assert_eq!(record.chunks.len(), 2);
    assert_eq!(record.chunks[0].length, 4);
    assert_eq!(record.chunks[1].length, 1);

    let snapshot = catalog.get_snapshot(&snapshot_id).unwrap().unwrap();
    assert_eq!(snapshot.total_files, 1);
    assert_eq!(snapshot.total_bytes, 5);
}

/// S2: two files with identical content share one chunk; dedup ratio
/// reflects two references backed by one stored chunk.
#[test]
fn s2_identical_files_dedupe_to_one_chunk() {
    let (catalog, store, hasher, _chunks) = env();
    let source = tempdir().unwrap();
    fs::write(source.path().join("a.txt"), b"hello").unwrap();
    fs::write(source.path().join("b.txt"), b"hello").unwrap();

    let backup = BackupCoordinator::new(Arc::clone(&catalog), Arc::clone(&store), Arc::clone(&hasher));
    let mut options = BackupOptions::default();
    options.chunking_mode = ChunkingMode::Fixed;
    options.chunk_size = 64;

    let outcome = backup.run_full(source.path(), &options, &NullProgressSink).unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.stats.chunks_new, 1);
    assert_eq!(outcome.stats.chunks_shared, 1);
    assert_eq!(outcome.stats.dedup_ratio(), 2.0);

    let (chunk_count, _) = store.size().unwrap();
    assert_eq!(chunk_count, 1);
}

/// S3: an incremental backup copies the unchanged file forward by
/// reference and reports exactly one MODIFIED diff entry for the file
/// whose content changed (same size, different bytes).
#[test]
fn s3_incremental_backup_detects_single_modification() {
    let (catalog, store, hasher, _chunks) = env();
    let source = tempdir().unwrap();
    fs::write(source.path().join("a.txt"), b"hi").unwrap();
    fs::write(source.path().join("b.txt"), b"there").unwrap();

    let backup = BackupCoordinator::new(Arc::clone(&catalog), Arc::clone(&store), Arc::clone(&hasher));
    let options = BackupOptions::default();
    let first = backup.run_full(source.path(), &options, &NullProgressSink).unwrap();
    let s1_id = first.snapshot_id.unwrap();

    fs::write(source.path().join("b.txt"), b"world").unwrap();

    let second = backup
        .run_incremental(source.path(), &s1_id, &options, &NullProgressSink, &WalkChangeDetector)
        .unwrap();
    let s2_id = second.snapshot_id.unwrap();

    let s2_files = catalog.list_files(&s2_id).unwrap();
    assert_eq!(s2_files.len(), 2);

    let s1 = catalog.get_snapshot(&s1_id).unwrap().unwrap();
    let s2 = catalog.get_snapshot(&s2_id).unwrap().unwrap();
    assert_ne!(s1.root_merkle_hash, s2.root_merkle_hash);

    let differ = MerkleDiffer::new(catalog.as_ref());
    let diff = differ.diff(s1.root_merkle_hash, s2.root_merkle_hash).unwrap();
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].path, "b.txt");
    assert_eq!(diff[0].kind, strata::merkle::ChangeKind::Modified);
}

/// S4: backing up an empty directory yields an empty snapshot whose
/// root hash is the fixed empty-directory hash.
#[test]
fn s4_empty_directory_has_fixed_root_hash() {
    let (catalog, store, hasher, _chunks) = env();
    let source = tempdir().unwrap();

    let backup = BackupCoordinator::new(Arc::clone(&catalog), Arc::clone(&store), Arc::clone(&hasher));
    let options = BackupOptions::default();
    let outcome = backup.run_full(source.path(), &options, &NullProgressSink).unwrap();
    assert!(outcome.is_success());

    let snapshot_id = outcome.snapshot_id.unwrap();
    let snapshot = catalog.get_snapshot(&snapshot_id).unwrap().unwrap();
    assert_eq!(snapshot.total_files, 0);
    assert_eq!(snapshot.total_bytes, 0);
    assert_eq!(snapshot.root_merkle_hash, Some(empty_dir_hash(hasher.as_ref())));
}

/// S5: corrupting one chunk fails only the file that referenced it;
/// every other file restores successfully.
#[test]
fn s5_corrupted_chunk_fails_only_its_file() {
    let (catalog, store, hasher, chunks) = env();
    let source = tempdir().unwrap();
    fs::write(source.path().join("safe.txt"), b"untouched content").unwrap();
    fs::write(source.path().join("hurt.txt"), b"this chunk gets corrupted").unwrap();

    let backup = BackupCoordinator::new(Arc::clone(&catalog), Arc::clone(&store), Arc::clone(&hasher));
    let options = BackupOptions::default();
    let outcome = backup.run_full(source.path(), &options, &NullProgressSink).unwrap();
    let snapshot_id = outcome.snapshot_id.unwrap();

    let files = catalog.list_files(&snapshot_id).unwrap();
    let hurt = files.iter().find(|f| f.relative_path == "hurt.txt").unwrap();
    let hurt_hash = hurt.chunks[0].chunk_hash;
    let path = LayoutStrategy::TwoPrefix.locator(chunks.path(), hurt_hash);
    fs::write(&path, b"corrupted!!").unwrap();

    let target = tempdir().unwrap();
    let restore = RestoreCoordinator::new(Arc::clone(&catalog), Arc::clone(&store), Arc::clone(&hasher));
    let restore_outcome = restore
        .restore(&snapshot_id, target.path(), &RestoreOptions::default(), &NullProgressSink)
        .unwrap();

    assert_eq!(restore_outcome.stats.files_errored, 1);
    assert_eq!(restore_outcome.stats.files_processed, 1);
    assert_eq!(
        fs::read(target.path().join("safe.txt")).unwrap(),
        b"untouched content"
    );
    assert!(!target.path().join("hurt.txt").exists());
}

/// S6: after the only snapshot referencing a chunk is deleted, GC
/// removes that chunk but keeps chunks still referenced elsewhere.
#[test]
fn s6_gc_after_snapshot_deletion_removes_only_unreferenced_chunks() {
    let (catalog, store, hasher, _chunks) = env();
    let source_a = tempdir().unwrap();
    fs::write(source_a.path().join("only_here.txt"), b"unique to snapshot A").unwrap();
    fs::write(source_a.path().join("shared.txt"), b"shared across snapshots").unwrap();

    let backup = BackupCoordinator::new(Arc::clone(&catalog), Arc::clone(&store), Arc::clone(&hasher));
    let options = BackupOptions::default();
    let outcome_a = backup.run_full(source_a.path(), &options, &NullProgressSink).unwrap();
    let snapshot_a = outcome_a.snapshot_id.unwrap();

    let files_a = catalog.list_files(&snapshot_a).unwrap();
    let unique_hash = files_a
        .iter()
        .find(|f| f.relative_path == "only_here.txt")
        .unwrap()
        .chunks[0]
        .chunk_hash;
    let shared_hash = files_a
        .iter()
        .find(|f| f.relative_path == "shared.txt")
        .unwrap()
        .chunks[0]
        .chunk_hash;

    let source_b = tempdir().unwrap();
    fs::write(source_b.path().join("shared.txt"), b"shared across snapshots").unwrap();
    let outcome_b = backup.run_full(source_b.path(), &options, &NullProgressSink).unwrap();
    let _snapshot_b = outcome_b.snapshot_id.unwrap();

    catalog.delete_snapshot(&snapshot_a).unwrap();

    let live_set = catalog.live_chunk_hashes().unwrap();
    let deleted = store.sweep(&live_set).unwrap();
    assert_eq!(deleted, 1);

    assert!(!store.exists(unique_hash).unwrap());
    assert!(store.exists(shared_hash).unwrap());
}

/// S7: backing up an unchanged directory twice produces two snapshots
/// with equal root hashes, and the CAS gains no new bytes on the
/// second run.
#[test]
fn s7_unchanged_directory_backed_up_twice_shares_root_hash_and_cas_size() {
    let (catalog, store, hasher, _chunks) = env();
    let source = tempdir().unwrap();
    fs::write(source.path().join("a.txt"), b"same content").unwrap();
    fs::create_dir_all(source.path().join("sub")).unwrap();
    fs::write(source.path().join("sub/b.txt"), b"also unchanged").unwrap();

    let backup = BackupCoordinator::new(Arc::clone(&catalog), Arc::clone(&store), Arc::clone(&hasher));
    let options = BackupOptions::default();

    let first = backup.run_full(source.path(), &options, &NullProgressSink).unwrap();
    let s1_id = first.snapshot_id.unwrap();
    let (chunk_count_after_first, bytes_after_first) = store.size().unwrap();

    let second = backup.run_full(source.path(), &options, &NullProgressSink).unwrap();
    let s2_id = second.snapshot_id.unwrap();
    let (chunk_count_after_second, bytes_after_second) = store.size().unwrap();

    let s1 = catalog.get_snapshot(&s1_id).unwrap().unwrap();
    let s2 = catalog.get_snapshot(&s2_id).unwrap().unwrap();
    assert_eq!(s1.root_merkle_hash, s2.root_merkle_hash);
    assert_eq!(chunk_count_after_first, chunk_count_after_second);
    assert_eq!(bytes_after_first, bytes_after_second);
}

/// Cross-cutting invariant: Σ chunk lengths equals file size for
/// every FileRecord in a committed snapshot.
#[test]
fn chunk_lengths_sum_to_file_size_invariant() {
    let (catalog, store, hasher, _chunks) = env();
    let source = tempdir().unwrap();
    fs::write(source.path().join("odd_sized.bin"), vec![7u8; 10_007]).unwrap();

    let backup = BackupCoordinator::new(Arc::clone(&catalog), Arc::clone(&store), Arc::clone(&hasher));
    let mut options = BackupOptions::default();
    options.chunking_mode = ChunkingMode::Cdc;
    let outcome = backup.run_full(source.path(), &options, &NullProgressSink).unwrap();
    let snapshot_id = outcome.snapshot_id.unwrap();

    for record in catalog.list_files(&snapshot_id).unwrap() {
        assert_eq!(record.chunk_length_sum(), record.size);
    }
}

/// Cross-cutting invariant: two snapshots with the same set of
/// (relative_path, file_hash) pairs share a Merkle root.
#[test]
fn identical_path_and_hash_sets_share_merkle_root() {
    let hasher = Sha256Hasher;
    let records_a = vec![fake_record("x.txt", &hasher, b"abc"), fake_record("y.txt", &hasher, b"def")];
    let records_b = vec![fake_record("y.txt", &hasher, b"def"), fake_record("x.txt", &hasher, b"abc")];

    let (_, root_a) = merkle::build(&records_a, &hasher);
    let (_, root_b) = merkle::build(&records_b, &hasher);
    assert_eq!(root_a, root_b);
}

fn fake_record(
    path: &str,
    hasher: &Sha256Hasher,
    content: &[u8],
) -> strata::model::FileRecord {
    let hash = hasher.hash(content);
    strata::model::FileRecord {
        relative_path: path.to_string(),
        size: content.len() as u64,
        mtime_seconds: 0,
        mtime_nanos: 0,
        mode: 0o644,
        file_type: strata::model::FileType::Regular,
        symlink_target: None,
        chunks: vec![strata::model::ChunkRef {
            offset: 0,
            length: content.len() as u64,
            chunk_hash: hash,
        }],
        chunking_mode: ChunkingMode::Fixed,
        file_hash: hash,
    }
}
