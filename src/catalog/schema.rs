//! DDL for the embedded SQL catalog. Applied once at `Catalog::open` time
//! via a single `execute_batch`.

pub const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS blobs (
        digest     TEXT PRIMARY KEY,
        size       INTEGER NOT NULL,
        refcount   INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS nodes (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id       INTEGER NOT NULL DEFAULT 0,
        name            TEXT NOT NULL,
        is_folder       INTEGER NOT NULL,
        digest          TEXT NULL REFERENCES blobs(digest),
        size            INTEGER NOT NULL DEFAULT 0,
        upload_time     INTEGER NOT NULL,
        download_count  INTEGER NOT NULL DEFAULT 0,
        UNIQUE(parent_id, name)
    );
    CREATE INDEX IF NOT EXISTS idx_nodes_parent_id ON nodes(parent_id);
";
