//! Metadata catalog: an embedded SQLite store holding the `nodes` and
//! `blobs` tables, opened once and shared behind a mutex so every multi-step
//! mutation can run inside a single serializable transaction.

pub mod node;
pub mod schema;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

pub use node::{Node, NodeKind, ROOT_ID};

use crate::error::AppResult;

#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl Catalog {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` inside one serializable transaction on the blocking pool,
    /// committing on `Ok` and rolling back on `Err`. This is the seam every
    /// multi-step C5 operation (upload-commit, move, copy, delete) uses so
    /// conflict checks and writes share one transaction boundary.
    pub async fn with_tx<F, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let tx = guard.transaction()?;
            let result = f(&tx);
            match result {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                Err(e) => {
                    // Rolling back happens automatically on Transaction drop;
                    // make it explicit for readability.
                    let _ = tx.rollback();
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| crate::error::AppError::TransportError(format!("task join: {e}")))?
    }

    /// Synchronous escape hatch for call sites outside the async runtime
    /// (the startup GC sweep runs before the server starts accepting
    /// connections). Takes the same mutex as `with_tx` but runs `f` on the
    /// calling thread instead of the blocking pool.
    pub fn with_blocking_conn<F, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> AppResult<T>,
    {
        let guard = self.conn.lock();
        f(&guard)
    }

    pub async fn get_by_id(&self, id: i64) -> AppResult<Node> {
        self.with_tx(move |tx| node::get_by_id(tx, id)).await
    }

    pub async fn list_children(&self, parent_id: i64) -> AppResult<Vec<Node>> {
        self.with_tx(move |tx| node::list_children(tx, parent_id))
            .await
    }

    pub async fn get_by_parent_and_name(
        &self,
        parent_id: i64,
        name: String,
    ) -> AppResult<Option<Node>> {
        self.with_tx(move |tx| node::get_by_parent_and_name(tx, parent_id, &name))
            .await
    }

    pub async fn insert_folder(&self, parent_id: i64, name: String) -> AppResult<i64> {
        self.with_tx(move |tx| {
            let now = now_millis();
            node::insert_folder(tx, parent_id, &name, now)
        })
        .await
    }

    pub async fn increment_download_count(&self, id: i64) -> AppResult<()> {
        self.with_tx(move |tx| node::increment_download_count(tx, id))
            .await
    }

    /// Resolves a `/`-separated path from root by repeated
    /// `GetByParentAndName`. The empty path resolves to the synthetic root.
    pub async fn resolve(&self, path: String) -> AppResult<Node> {
        self.with_tx(move |tx| resolve_tx(tx, &path)).await
    }
}

pub(crate) fn resolve_tx(tx: &rusqlite::Transaction<'_>, path: &str) -> AppResult<Node> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Node::synthetic_root());
    }
    let mut current = Node::synthetic_root();
    for segment in trimmed.split('/') {
        match node::get_by_parent_and_name(tx, current.id, segment)? {
            Some(n) => current = n,
            None => {
                return Err(crate::error::AppError::NotFound(format!(
                    "path not found: {path}"
                )))
            }
        }
    }
    Ok(current)
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_walks_nested_folders() {
        let cat = Catalog::open_in_memory().unwrap();
        let dir = cat.insert_folder(ROOT_ID, "a".into()).await.unwrap();
        let sub = cat.insert_folder(dir, "b".into()).await.unwrap();
        let resolved = cat.resolve("/a/b".into()).await.unwrap();
        assert_eq!(resolved.id, sub);
    }

    #[tokio::test]
    async fn resolve_empty_path_is_root() {
        let cat = Catalog::open_in_memory().unwrap();
        let root = cat.resolve("/".into()).await.unwrap();
        assert_eq!(root.id, ROOT_ID);
        assert!(root.kind.is_directory());
    }

    #[tokio::test]
    async fn name_uniqueness_enforced_across_calls() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.insert_folder(ROOT_ID, "dup".into()).await.unwrap();
        let err = cat.insert_folder(ROOT_ID, "dup".into()).await.unwrap_err();
        assert!(matches!(err, crate::error::AppError::NameConflict(_)));
    }
}
