//! Metadata node CRUD. Every function here takes a `&rusqlite::Connection`
//! (a plain connection or an open transaction, since `Transaction` derefs to
//! `Connection`) so callers control the transaction boundary — composite
//! operations in `service.rs` open one transaction and call several of these
//! in sequence.

use rusqlite::{params, OptionalExtension};
use unicode_normalization::UnicodeNormalization;

use crate::digest::Digest;
use crate::error::{AppError, AppResult};

pub const ROOT_ID: i64 = 0;

/// Names are stored NFC-normalized so two byte-distinct Unicode spellings of
/// the same visible filename can't both exist under one parent.
fn normalize_name(name: &str) -> String {
    name.nfc().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    fn as_db(self) -> i64 {
        match self {
            NodeKind::File => 0,
            NodeKind::Directory => 1,
        }
    }

    fn from_db(v: i64) -> Self {
        if v == 0 {
            NodeKind::File
        } else {
            NodeKind::Directory
        }
    }

    pub fn is_directory(self) -> bool {
        matches!(self, NodeKind::Directory)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: i64,
    pub parent_id: i64,
    pub name: String,
    pub kind: NodeKind,
    pub digest: Option<Digest>,
    pub size: u64,
    pub upload_time: i64,
    pub download_count: i64,
}

impl Node {
    /// The implicit root directory: id 0, never stored in `nodes`.
    pub fn synthetic_root() -> Self {
        Node {
            id: ROOT_ID,
            parent_id: ROOT_ID,
            name: String::new(),
            kind: NodeKind::Directory,
            digest: None,
            size: 0,
            upload_time: 0,
            download_count: 0,
        }
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let digest_str: Option<String> = row.get("digest")?;
    let kind_db: i64 = row.get("is_folder")?;
    Ok(Node {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        name: row.get("name")?,
        kind: NodeKind::from_db(kind_db),
        digest: digest_str.and_then(|s| s.parse().ok()),
        size: row.get::<_, i64>("size")? as u64,
        upload_time: row.get("upload_time")?,
        download_count: row.get("download_count")?,
    })
}

pub fn get_by_id(conn: &rusqlite::Connection, id: i64) -> AppResult<Node> {
    if id == ROOT_ID {
        return Ok(Node::synthetic_root());
    }
    conn.query_row(
        "SELECT id, parent_id, name, is_folder, digest, size, upload_time, download_count
         FROM nodes WHERE id = ?1",
        params![id],
        row_to_node,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("node {id}")))
}

pub fn list_children(conn: &rusqlite::Connection, parent_id: i64) -> AppResult<Vec<Node>> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, name, is_folder, digest, size, upload_time, download_count
         FROM nodes WHERE parent_id = ?1 ORDER BY name",
    )?;
    let rows = stmt.query_map(params![parent_id], row_to_node)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn get_by_parent_and_name(
    conn: &rusqlite::Connection,
    parent_id: i64,
    name: &str,
) -> AppResult<Option<Node>> {
    Ok(conn
        .query_row(
            "SELECT id, parent_id, name, is_folder, digest, size, upload_time, download_count
             FROM nodes WHERE parent_id = ?1 AND name = ?2",
            params![parent_id, name],
            row_to_node,
        )
        .optional()?)
}

fn require_directory(conn: &rusqlite::Connection, parent_id: i64) -> AppResult<()> {
    let parent = get_by_id(conn, parent_id)?;
    if !parent.kind.is_directory() {
        return Err(AppError::BadTarget(format!(
            "parent {parent_id} is not a directory"
        )));
    }
    Ok(())
}

pub fn insert_file(
    conn: &rusqlite::Connection,
    parent_id: i64,
    name: &str,
    digest: &Digest,
    size: u64,
    now_millis: i64,
) -> AppResult<i64> {
    let name = &normalize_name(name);
    require_directory(conn, parent_id)?;
    if get_by_parent_and_name(conn, parent_id, name)?.is_some() {
        return Err(AppError::NameConflict(format!(
            "{name} already exists under {parent_id}"
        )));
    }
    conn.execute(
        "INSERT INTO nodes (parent_id, name, is_folder, digest, size, upload_time, download_count)
         VALUES (?1, ?2, 0, ?3, ?4, ?5, 0)",
        params![parent_id, name, digest.to_string(), size as i64, now_millis],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_folder(
    conn: &rusqlite::Connection,
    parent_id: i64,
    name: &str,
    now_millis: i64,
) -> AppResult<i64> {
    let name = &normalize_name(name);
    require_directory(conn, parent_id)?;
    if get_by_parent_and_name(conn, parent_id, name)?.is_some() {
        return Err(AppError::NameConflict(format!(
            "{name} already exists under {parent_id}"
        )));
    }
    conn.execute(
        "INSERT INTO nodes (parent_id, name, is_folder, digest, size, upload_time, download_count)
         VALUES (?1, ?2, 1, NULL, 0, ?3, 0)",
        params![parent_id, name, now_millis],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Replaces the content reference of a file node in place, preserving its id.
pub fn update_file_content(
    conn: &rusqlite::Connection,
    id: i64,
    digest: &Digest,
    size: u64,
    now_millis: i64,
) -> AppResult<()> {
    let n = conn.execute(
        "UPDATE nodes SET digest = ?1, size = ?2, upload_time = ?3
         WHERE id = ?4 AND is_folder = 0",
        params![digest.to_string(), size as i64, now_millis, id],
    )?;
    if n == 0 {
        return Err(AppError::NotFound(format!("file node {id}")));
    }
    Ok(())
}

pub fn rename(conn: &rusqlite::Connection, id: i64, new_name: &str) -> AppResult<()> {
    let new_name = &normalize_name(new_name);
    let node = get_by_id(conn, id)?;
    if get_by_parent_and_name(conn, node.parent_id, new_name)?.is_some() {
        return Err(AppError::NameConflict(format!(
            "{new_name} already exists under {}",
            node.parent_id
        )));
    }
    conn.execute(
        "UPDATE nodes SET name = ?1 WHERE id = ?2",
        params![new_name, id],
    )?;
    Ok(())
}

/// Combined move+rename. Callers are responsible for the cycle check
/// (`is_ancestor`) before calling this — it only enforces I1.
pub fn reparent(
    conn: &rusqlite::Connection,
    id: i64,
    new_parent_id: i64,
    new_name: &str,
) -> AppResult<()> {
    let new_name = &normalize_name(new_name);
    require_directory(conn, new_parent_id)?;
    if get_by_parent_and_name(conn, new_parent_id, new_name)?.is_some() {
        return Err(AppError::NameConflict(format!(
            "{new_name} already exists under {new_parent_id}"
        )));
    }
    let n = conn.execute(
        "UPDATE nodes SET parent_id = ?1, name = ?2 WHERE id = ?3",
        params![new_parent_id, new_name, id],
    )?;
    if n == 0 {
        return Err(AppError::NotFound(format!("node {id}")));
    }
    Ok(())
}

pub fn increment_download_count(conn: &rusqlite::Connection, id: i64) -> AppResult<()> {
    let n = conn.execute(
        "UPDATE nodes SET download_count = download_count + 1 WHERE id = ?1",
        params![id],
    )?;
    if n == 0 {
        return Err(AppError::NotFound(format!("node {id}")));
    }
    Ok(())
}

/// Walks the parent chain from `start` upward, returning `true` if `ancestor`
/// is encountered (or equals `start`). Root (id 0) terminates the walk.
pub fn is_ancestor_or_self(
    conn: &rusqlite::Connection,
    ancestor: i64,
    start: i64,
) -> AppResult<bool> {
    let mut cur = start;
    loop {
        if cur == ancestor {
            return Ok(true);
        }
        if cur == ROOT_ID {
            return Ok(false);
        }
        cur = get_by_id(conn, cur)?.parent_id;
    }
}

/// Deletes `id` and, if it is a directory, its entire subtree, in an
/// iterative post-order traversal (per the design note on bounding call
/// depth). Returns every file node removed, so callers can decrement each
/// one's blob refcount.
pub fn delete_subtree(conn: &rusqlite::Connection, id: i64) -> AppResult<Vec<Node>> {
    let root = get_by_id(conn, id)?;

    // Collect the whole subtree first (pre-order via an explicit stack),
    // then delete bottom-up so FK references never dangle mid-delete.
    let mut stack = vec![root.clone()];
    let mut all = Vec::new();
    while let Some(n) = stack.pop() {
        if n.kind.is_directory() {
            for child in list_children(conn, n.id)? {
                stack.push(child);
            }
        }
        all.push(n);
    }

    let removed_files: Vec<Node> = all
        .iter()
        .filter(|n| !n.kind.is_directory())
        .cloned()
        .collect();

    // Delete deepest-first is unnecessary (no cascading FK to nodes.id),
    // but deleting every collected id keeps this independent of ordering.
    for n in &all {
        conn.execute("DELETE FROM nodes WHERE id = ?1", params![n.id])?;
    }

    Ok(removed_files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::SCHEMA;

    fn open_db() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn
    }

    #[test]
    fn insert_file_enforces_name_uniqueness() {
        let conn = open_db();
        let d: Digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
            .parse()
            .unwrap();
        conn.execute(
            "INSERT INTO blobs (digest, size, refcount, created_at) VALUES (?1, 0, 1, 0)",
            params![d.to_string()],
        )
        .unwrap();
        insert_file(&conn, ROOT_ID, "a.txt", &d, 0, 0).unwrap();
        let err = insert_file(&conn, ROOT_ID, "a.txt", &d, 0, 0).unwrap_err();
        assert!(matches!(err, AppError::NameConflict(_)));
    }

    #[test]
    fn delete_subtree_removes_nested_files() {
        let conn = open_db();
        let dir = insert_folder(&conn, ROOT_ID, "p", 0).unwrap();
        let sub = insert_folder(&conn, dir, "q", 0).unwrap();
        let d: Digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
            .parse()
            .unwrap();
        conn.execute(
            "INSERT INTO blobs (digest, size, refcount, created_at) VALUES (?1, 0, 1, 0)",
            params![d.to_string()],
        )
        .unwrap();
        insert_file(&conn, sub, "r.txt", &d, 0, 0).unwrap();

        let removed = delete_subtree(&conn, dir).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(get_by_id(&conn, dir).is_err());
        assert!(get_by_id(&conn, sub).is_err());
    }

    #[test]
    fn insert_normalizes_name_to_nfc_before_checking_uniqueness() {
        let conn = open_db();
        let d: Digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
            .parse()
            .unwrap();
        conn.execute(
            "INSERT INTO blobs (digest, size, refcount, created_at) VALUES (?1, 0, 1, 0)",
            params![d.to_string()],
        )
        .unwrap();
        // "cafe\u{0301}" (NFD: e + combining acute) vs "caf\u{e9}" (NFC) name the same glyphs.
        insert_file(&conn, ROOT_ID, "cafe\u{0301}.txt", &d, 0, 0).unwrap();
        let err = insert_file(&conn, ROOT_ID, "caf\u{e9}.txt", &d, 0, 0).unwrap_err();
        assert!(matches!(err, AppError::NameConflict(_)));
    }

    #[test]
    fn is_ancestor_detects_self_and_descendant() {
        let conn = open_db();
        let p = insert_folder(&conn, ROOT_ID, "p", 0).unwrap();
        let q = insert_folder(&conn, p, "q", 0).unwrap();
        assert!(is_ancestor_or_self(&conn, p, q).unwrap());
        assert!(is_ancestor_or_self(&conn, p, p).unwrap());
        assert!(!is_ancestor_or_self(&conn, q, p).unwrap());
    }
}
