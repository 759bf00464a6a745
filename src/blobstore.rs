//! Blob store: the `blobs` table's insert-or-increment / decrement /
//! lookup semantics.
//!
//! These are free functions over a `&rusqlite::Connection` — a plain
//! connection or an open transaction — rather than a type owning its own
//! connection, because refcount updates must happen inside the same
//! transaction as the catalog mutation they guard. Placing the backing
//! file on disk is the caller's job: these functions only ever report
//! whether placement is needed.

use rusqlite::{params, OptionalExtension};

use crate::digest::Digest;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRecord {
    pub size: u64,
    pub refcount: i64,
    pub created_at: i64,
}

/// Outcome of `insert_or_increment`: the new refcount, and whether the
/// caller must still place the backing file (true only on first reference).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub refcount: i64,
    pub needs_placement: bool,
}

pub fn lookup(conn: &rusqlite::Connection, digest: &Digest) -> AppResult<Option<BlobRecord>> {
    Ok(conn
        .query_row(
            "SELECT size, refcount, created_at FROM blobs WHERE digest = ?1",
            params![digest.to_string()],
            |row| {
                Ok(BlobRecord {
                    size: row.get::<_, i64>(0)? as u64,
                    refcount: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()?)
}

pub fn insert_or_increment(
    conn: &rusqlite::Connection,
    digest: &Digest,
    size: u64,
    now: i64,
) -> AppResult<InsertOutcome> {
    match lookup(conn, digest)? {
        None => {
            conn.execute(
                "INSERT INTO blobs (digest, size, refcount, created_at) VALUES (?1, ?2, 1, ?3)",
                params![digest.to_string(), size as i64, now],
            )?;
            Ok(InsertOutcome {
                refcount: 1,
                needs_placement: true,
            })
        }
        Some(rec) if rec.size == size => {
            conn.execute(
                "UPDATE blobs SET refcount = refcount + 1 WHERE digest = ?1",
                params![digest.to_string()],
            )?;
            Ok(InsertOutcome {
                refcount: rec.refcount + 1,
                needs_placement: false,
            })
        }
        Some(rec) => Err(AppError::DigestCollision {
            digest: digest.to_string(),
            existing_size: rec.size,
            new_size: size,
        }),
    }
}

/// Decrements the refcount for `digest`. Returns the new refcount (0 if the
/// record was deleted). The record delete is authoritative; removing the
/// on-disk file is the caller's responsibility and is best-effort.
pub fn decrement(conn: &rusqlite::Connection, digest: &Digest) -> AppResult<i64> {
    let rec = lookup(conn, digest)?
        .ok_or_else(|| AppError::NotFound(format!("blob {digest}")))?;
    if rec.refcount <= 0 {
        return Err(AppError::InvariantViolation(format!(
            "blob {digest} had non-positive refcount {}",
            rec.refcount
        )));
    }
    let new_count = rec.refcount - 1;
    if new_count == 0 {
        conn.execute(
            "DELETE FROM blobs WHERE digest = ?1",
            params![digest.to_string()],
        )?;
    } else {
        conn.execute(
            "UPDATE blobs SET refcount = ?1 WHERE digest = ?2",
            params![new_count, digest.to_string()],
        )?;
    }
    Ok(new_count)
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

    fn digest_of(bytes: &[u8]) -> Digest {
        let mut h = crate::digest::StreamingHasher::new();
        h.update(bytes);
        h.finalize()
    }

    #[test]
    fn first_insert_needs_placement_second_does_not() {
        let conn = open_db();
        let d = digest_of(b"hello");
        let first = insert_or_increment(&conn, &d, 5, 0).unwrap();
        assert_eq!(first.refcount, 1);
        assert!(first.needs_placement);

        let second = insert_or_increment(&conn, &d, 5, 0).unwrap();
        assert_eq!(second.refcount, 2);
        assert!(!second.needs_placement);
    }

    #[test]
    fn mismatched_size_is_a_digest_collision() {
        let conn = open_db();
        let d = digest_of(b"hello");
        insert_or_increment(&conn, &d, 5, 0).unwrap();
        let err = insert_or_increment(&conn, &d, 6, 0).unwrap_err();
        assert!(matches!(err, AppError::DigestCollision { .. }));
    }

    #[test]
    fn decrement_to_zero_deletes_record() {
        let conn = open_db();
        let d = digest_of(b"hello");
        insert_or_increment(&conn, &d, 5, 0).unwrap();
        let rc = decrement(&conn, &d).unwrap();
        assert_eq!(rc, 0);
        assert!(lookup(&conn, &d).unwrap().is_none());
    }

    #[test]
    fn decrement_unknown_digest_is_not_found() {
        let conn = open_db();
        let d = digest_of(b"missing");
        assert!(matches!(
            decrement(&conn, &d).unwrap_err(),
            AppError::NotFound(_)
        ));
    }
}
