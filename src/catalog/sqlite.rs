use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::BackupError;
use crate::hash::ChunkHash;
use crate::model::{
    CatalogStats, ChunkRef, ChunkingMode, FileRecord, FileType, MerkleChild, MerkleNode,
    MerkleNodeKind, Snapshot,
};

use super::{schema::SCHEMA, Catalog, SnapshotHandle};

/// SQLite-backed catalog. A single connection is serialized behind a
/// mutex: SQLite's own write-ahead log gives us read concurrency, and
/// the mutex gives us the single-writer semantics §5 asks for without
/// pulling in a connection pool for what is, per job, a modest write
/// volume.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackupError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, BackupError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
        let root_merkle_hash: Option<String> = row.get("root_merkle_hash")?;
        let created_at: String = row.get("created_at")?;
        Ok(Snapshot {
            id: row.get("id")?,
            description: row.get("description")?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            source_root: row.get("source_root")?,
            root_merkle_hash: root_merkle_hash.and_then(|h| ChunkHash::from_str(&h).ok()),
            total_files: row.get::<_, i64>("total_files")? as u64,
            total_bytes: row.get::<_, i64>("total_bytes")? as u64,
            parent_snapshot_id: row.get("parent_snapshot_id")?,
            committed: row.get::<_, i64>("committed")? != 0,
        })
    }

    fn file_type_from_str(s: &str) -> FileType {
        match s {
            "dir" => FileType::Directory,
            "symlink" => FileType::Symlink,
            _ => FileType::Regular,
        }
    }

    fn chunking_mode_from_str(s: &str) -> ChunkingMode {
        match s {
            "fixed" => ChunkingMode::Fixed,
            _ => ChunkingMode::Cdc,
        }
    }
}

impl Catalog for SqliteCatalog {
    fn create_snapshot(
        &self,
        id: &str,
        description: &str,
        source_root: &str,
        parent: Option<&str>,
    ) -> Result<SnapshotHandle, BackupError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO snapshots (id, description, created_at, source_root, parent_snapshot_id, committed)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![id, description, Utc::now().to_rfc3339(), source_root, parent],
        )?;
        Ok(SnapshotHandle { id: id.to_string() })
    }

    fn append_file(&self, handle: &SnapshotHandle, record: &FileRecord) -> Result<(), BackupError> {
        if record.chunk_length_sum() != record.size {
            return Err(BackupError::catalog_invariant(format!(
                "file {} chunk lengths sum to {} but size is {}",
                record.relative_path,
                record.chunk_length_sum(),
                record.size
            )));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM files WHERE snapshot_id = ?1 AND relative_path = ?2",
            params![handle.id, record.relative_path],
        )?;
        tx.execute(
            "INSERT INTO files (snapshot_id, relative_path, size, mtime_seconds, mtime_nanos,
                mode, file_type, symlink_target, chunking_mode, file_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                handle.id,
                record.relative_path,
                record.size as i64,
                record.mtime_seconds,
                record.mtime_nanos,
                record.mode,
                record.file_type.as_str(),
                record.symlink_target,
                record.chunking_mode.as_str(),
                record.file_hash.to_hex(),
            ],
        )?;
        let row_id = tx.last_insert_rowid();
        for (ordinal, chunk) in record.chunks.iter().enumerate() {
            tx.execute(
                "INSERT INTO file_chunks (file_row_id, ordinal, offset_val, length_val, chunk_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row_id,
                    ordinal as i64,
                    chunk.offset as i64,
                    chunk.length as i64,
                    chunk.chunk_hash.to_hex(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn copy_unchanged(
        &self,
        from: &str,
        to: &SnapshotHandle,
        changed_paths: &HashSet<String>,
    ) -> Result<u64, BackupError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut copied = 0u64;

        let old_rows: Vec<(i64, FileRecord)> = {
            let mut stmt = tx.prepare(
                "SELECT row_id, relative_path, size, mtime_seconds, mtime_nanos, mode,
                        file_type, symlink_target, chunking_mode, file_hash
                 FROM files WHERE snapshot_id = ?1",
            )?;
            let rows = stmt.query_map(params![from], |row| {
                let row_id: i64 = row.get("row_id")?;
                let file_type: String = row.get("file_type")?;
                let chunking_mode: String = row.get("chunking_mode")?;
                let file_hash: String = row.get("file_hash")?;
                Ok((
                    row_id,
                    FileRecord {
                        relative_path: row.get("relative_path")?,
                        size: row.get::<_, i64>("size")? as u64,
                        mtime_seconds: row.get("mtime_seconds")?,
                        mtime_nanos: row.get("mtime_nanos")?,
                        mode: row.get("mode")?,
                        file_type: Self::file_type_from_str(&file_type),
                        symlink_target: row.get("symlink_target")?,
                        chunks: Vec::new(),
                        chunking_mode: Self::chunking_mode_from_str(&chunking_mode),
                        file_hash: ChunkHash::from_str(&file_hash)
                            .map_err(|_| rusqlite::Error::InvalidQuery)?,
                    },
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for (old_row_id, record) in old_rows {
            if changed_paths.contains(&record.relative_path) {
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO files (snapshot_id, relative_path, size, mtime_seconds,
                    mtime_nanos, mode, file_type, symlink_target, chunking_mode, file_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    to.id,
                    record.relative_path,
                    record.size as i64,
                    record.mtime_seconds,
                    record.mtime_nanos,
                    record.mode,
                    record.file_type.as_str(),
                    record.symlink_target,
                    record.chunking_mode.as_str(),
                    record.file_hash.to_hex(),
                ],
            )?;
            let new_row_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO file_chunks (file_row_id, ordinal, offset_val, length_val, chunk_hash)
                 SELECT ?1, ordinal, offset_val, length_val, chunk_hash
                 FROM file_chunks WHERE file_row_id = ?2",
                params![new_row_id, old_row_id],
            )?;
            copied += 1;
        }

        tx.commit()?;
        Ok(copied)
    }

    fn commit(&self, handle: &SnapshotHandle, root_merkle_hash: ChunkHash) -> Result<Snapshot, BackupError> {
        let conn = self.conn.lock();
        let total_files: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE snapshot_id = ?1",
            params![handle.id],
            |row| row.get(0),
        )?;
        let total_bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM files WHERE snapshot_id = ?1",
            params![handle.id],
            |row| row.get(0),
        )?;
        conn.execute(
            "UPDATE snapshots SET root_merkle_hash = ?1, total_files = ?2, total_bytes = ?3,
                committed = 1 WHERE id = ?4",
            params![root_merkle_hash.to_hex(), total_files, total_bytes, handle.id],
        )?;
        conn.query_row(
            "SELECT * FROM snapshots WHERE id = ?1",
            params![handle.id],
            Self::row_to_snapshot,
        )
        .map_err(BackupError::from)
    }

    fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>, BackupError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM snapshots WHERE id = ?1", params![id], Self::row_to_snapshot)
            .optional()
            .map_err(BackupError::from)
    }

    fn list_snapshots(&self) -> Result<Vec<Snapshot>, BackupError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM snapshots WHERE committed = 1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], Self::row_to_snapshot)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(BackupError::from)
    }

    fn list_files(&self, snapshot_id: &str) -> Result<Vec<FileRecord>, BackupError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT row_id, relative_path, size, mtime_seconds, mtime_nanos, mode,
                    file_type, symlink_target, chunking_mode, file_hash
             FROM files WHERE snapshot_id = ?1 ORDER BY relative_path ASC",
        )?;
        let file_rows: Vec<(i64, FileRecord)> = stmt
            .query_map(params![snapshot_id], |row| {
                let row_id: i64 = row.get("row_id")?;
                let file_type: String = row.get("file_type")?;
                let chunking_mode: String = row.get("chunking_mode")?;
                let file_hash: String = row.get("file_hash")?;
                Ok((
                    row_id,
                    FileRecord {
                        relative_path: row.get("relative_path")?,
                        size: row.get::<_, i64>("size")? as u64,
                        mtime_seconds: row.get("mtime_seconds")?,
                        mtime_nanos: row.get("mtime_nanos")?,
                        mode: row.get("mode")?,
                        file_type: Self::file_type_from_str(&file_type),
                        symlink_target: row.get("symlink_target")?,
                        chunks: Vec::new(),
                        chunking_mode: Self::chunking_mode_from_str(&chunking_mode),
                        file_hash: ChunkHash::from_str(&file_hash)
                            .map_err(|_| rusqlite::Error::InvalidQuery)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut chunk_stmt = conn.prepare(
            "SELECT offset_val, length_val, chunk_hash FROM file_chunks
             WHERE file_row_id = ?1 ORDER BY ordinal ASC",
        )?;

        let mut out = Vec::with_capacity(file_rows.len());
        for (row_id, mut record) in file_rows {
            let chunks = chunk_stmt
                .query_map(params![row_id], |row| {
                    let hash_str: String = row.get("chunk_hash")?;
                    Ok(ChunkRef {
                        offset: row.get::<_, i64>("offset_val")? as u64,
                        length: row.get::<_, i64>("length_val")? as u64,
                        chunk_hash: ChunkHash::from_str(&hash_str)
                            .map_err(|_| rusqlite::Error::InvalidQuery)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            record.chunks = chunks;
            out.push(record);
        }
        Ok(out)
    }

    fn delete_snapshot(&self, id: &str) -> Result<(), BackupError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        // children first so no dangling parent_snapshot_id references linger
        tx.execute(
            "UPDATE snapshots SET parent_snapshot_id = NULL WHERE parent_snapshot_id = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(BackupError::snapshot_not_found(id));
        }
        tx.commit()?;
        Ok(())
    }

    fn upsert_merkle_node(&self, node: &MerkleNode) -> Result<(), BackupError> {
        let conn = self.conn.lock();
        let children_json = serde_json::to_string(&node.children)?;
        conn.execute(
            "INSERT INTO merkle_nodes (hash, kind, name, size, children) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(hash) DO NOTHING",
            params![
                node.hash.to_hex(),
                kind_str(node.kind),
                node.name,
                node.size as i64,
                children_json
            ],
        )?;
        Ok(())
    }

    fn get_merkle_node(&self, hash: ChunkHash) -> Result<Option<MerkleNode>, BackupError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT hash, kind, name, size, children FROM merkle_nodes WHERE hash = ?1",
            params![hash.to_hex()],
            |row| {
                let kind: String = row.get("kind")?;
                let children_json: String = row.get("children")?;
                let children: Vec<MerkleChild> = serde_json::from_str(&children_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?;
                Ok(MerkleNode {
                    hash,
                    kind: kind_from_str(&kind),
                    name: row.get("name")?,
                    size: row.get::<_, i64>("size")? as u64,
                    children,
                })
            },
        )
        .optional()
        .map_err(BackupError::from)
    }

    fn live_chunk_hashes(&self) -> Result<HashSet<ChunkHash>, BackupError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT fc.chunk_hash FROM file_chunks fc
             JOIN files f ON f.row_id = fc.file_row_id
             JOIN snapshots s ON s.id = f.snapshot_id
             WHERE s.committed = 1",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for hash_str in rows {
            let hash_str = hash_str?;
            if let Ok(hash) = ChunkHash::from_str(&hash_str) {
                out.insert(hash);
            }
        }
        Ok(out)
    }

    fn stats(&self) -> Result<CatalogStats, BackupError> {
        let conn = self.conn.lock();
        let snapshot_count: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        let committed_snapshot_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE committed = 1",
            [],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT file_type, COALESCE(SUM(size), 0) FROM files
             JOIN snapshots ON snapshots.id = files.snapshot_id
             WHERE snapshots.committed = 1 GROUP BY file_type",
        )?;
        let mut data_type_sizes = std::collections::HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (file_type, bytes) = row?;
            data_type_sizes.insert(file_type, bytes);
        }

        Ok(CatalogStats {
            snapshot_count: snapshot_count as u64,
            committed_snapshot_count: committed_snapshot_count as u64,
            data_type_sizes,
        })
    }
}

fn kind_str(kind: MerkleNodeKind) -> &'static str {
    match kind {
        MerkleNodeKind::File => "file",
        MerkleNodeKind::Dir => "dir",
    }
}

fn kind_from_str(s: &str) -> MerkleNodeKind {
    match s {
        "dir" => MerkleNodeKind::Dir,
        _ => MerkleNodeKind::File,
    }
}
