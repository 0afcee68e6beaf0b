//! SQL DDL for the catalog. Kept in one place so the ACID contract
//! (foreign keys, single-writer transactions) is visible at a glance.

pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS snapshots (
    id                  TEXT PRIMARY KEY,
    description         TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    source_root         TEXT NOT NULL,
    root_merkle_hash    TEXT,
    total_files         INTEGER NOT NULL DEFAULT 0,
    total_bytes         INTEGER NOT NULL DEFAULT 0,
    parent_snapshot_id  TEXT,
    committed           INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (parent_snapshot_id) REFERENCES snapshots(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS files (
    row_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id     TEXT NOT NULL,
    relative_path   TEXT NOT NULL,
    size            INTEGER NOT NULL,
    mtime_seconds   INTEGER NOT NULL,
    mtime_nanos     INTEGER NOT NULL,
    mode            INTEGER NOT NULL,
    file_type       TEXT NOT NULL,
    symlink_target  TEXT,
    chunking_mode   TEXT NOT NULL,
    file_hash       TEXT NOT NULL,
    UNIQUE(snapshot_id, relative_path),
    FOREIGN KEY (snapshot_id) REFERENCES snapshots(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS file_chunks (
    file_row_id INTEGER NOT NULL,
    ordinal     INTEGER NOT NULL,
    offset_val  INTEGER NOT NULL,
    length_val  INTEGER NOT NULL,
    chunk_hash  TEXT NOT NULL,
    PRIMARY KEY (file_row_id, ordinal),
    FOREIGN KEY (file_row_id) REFERENCES files(row_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_file_chunks_hash ON file_chunks(chunk_hash);
CREATE INDEX IF NOT EXISTS idx_files_snapshot ON files(snapshot_id);

CREATE TABLE IF NOT EXISTS merkle_nodes (
    hash        TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    name        TEXT NOT NULL,
    size        INTEGER NOT NULL,
    children    TEXT NOT NULL
);
"#;
