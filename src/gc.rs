//! Startup GC sweep: reconciles the on-disk blob directory against the
//! `blobs` table.
//!
//! Two failure modes are possible after a crash between blob placement and
//! transaction commit (or the reverse, after a compensating rollback):
//! a file on disk with no `blobs` row (orphan — safe to delete), and a
//! `blobs` row with no file on disk (a `MissingBlob` the file service
//! surfaces lazily on download; this sweep only logs it).

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::digest::Digest;

#[derive(Debug, Clone, Copy, Default)]
pub struct GcReport {
    pub orphan_files_found: u64,
    pub orphan_files_deleted: u64,
    pub missing_blobs_found: u64,
}

/// Scans `data_dir` for blob files with no matching `blobs` row, and
/// `blobs` rows with no matching file, without deleting anything.
pub fn gc_dry_run(catalog: &Catalog, data_dir: &Path) -> Result<GcReport> {
    sweep(catalog, data_dir, false)
}

/// Same scan as `gc_dry_run`, but deletes orphaned blob files. Rows with a
/// missing backing file are never deleted here — a missing blob is a data
/// loss event, not something GC should paper over by amending the catalog.
pub fn gc_apply(catalog: &Catalog, data_dir: &Path) -> Result<GcReport> {
    sweep(catalog, data_dir, true)
}

fn sweep(catalog: &Catalog, data_dir: &Path, delete_orphans: bool) -> Result<GcReport> {
    let mut report = GcReport::default();
    if !data_dir.exists() {
        return Ok(report);
    }

    let known_digests: std::collections::HashSet<String> =
        catalog.with_blocking_conn(|conn| {
            let mut stmt = conn.prepare("SELECT digest FROM blobs")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut set = std::collections::HashSet::new();
            for r in rows {
                set.insert(r?);
            }
            Ok(set)
        })?;

    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Ok(_digest) = name.parse::<Digest>() else {
            continue;
        };
        if !known_digests.contains(name) {
            report.orphan_files_found += 1;
            if delete_orphans {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => report.orphan_files_deleted += 1,
                    Err(e) => warn!(file = %entry.path().display(), error = %e, "failed to delete orphaned blob"),
                }
            }
        }
    }

    let present_on_disk: std::collections::HashSet<String> = std::fs::read_dir(data_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_owned))
        .collect();
    for digest in &known_digests {
        if !present_on_disk.contains(digest) {
            report.missing_blobs_found += 1;
            warn!(%digest, "blob row has no backing file on disk");
        }
    }

    info!(
        orphan_files_found = report.orphan_files_found,
        orphan_files_deleted = report.orphan_files_deleted,
        missing_blobs_found = report.missing_blobs_found,
        "startup gc sweep complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore;
    use crate::digest::StreamingHasher;

    fn digest_of(bytes: &[u8]) -> Digest {
        let mut h = StreamingHasher::new();
        h.update(bytes);
        h.finalize()
    }

    #[test]
    fn dry_run_finds_orphan_without_deleting() {
        let data_dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let orphan = digest_of(b"orphan");
        std::fs::write(data_dir.path().join(orphan.to_string()), b"orphan").unwrap();

        let report = gc_dry_run(&catalog, data_dir.path()).unwrap();
        assert_eq!(report.orphan_files_found, 1);
        assert_eq!(report.orphan_files_deleted, 0);
        assert!(data_dir.path().join(orphan.to_string()).exists());
    }

    #[test]
    fn apply_deletes_orphan_but_keeps_referenced_blob() {
        let data_dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let kept = digest_of(b"kept");
        let orphan = digest_of(b"orphan");
        std::fs::write(data_dir.path().join(kept.to_string()), b"kept").unwrap();
        std::fs::write(data_dir.path().join(orphan.to_string()), b"orphan").unwrap();
        catalog
            .with_blocking_conn(move |conn| blobstore::insert_or_increment(conn, &kept, 4, 0))
            .unwrap();

        let report = gc_apply(&catalog, data_dir.path()).unwrap();
        assert_eq!(report.orphan_files_found, 1);
        assert_eq!(report.orphan_files_deleted, 1);
        assert_eq!(report.missing_blobs_found, 0);
        assert!(data_dir.path().join(kept.to_string()).exists());
        assert!(!data_dir.path().join(orphan.to_string()).exists());
    }

    #[test]
    fn missing_blob_is_reported_not_deleted() {
        let data_dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let missing = digest_of(b"missing");
        catalog
            .with_blocking_conn(move |conn| blobstore::insert_or_increment(conn, &missing, 7, 0))
            .unwrap();

        let report = gc_apply(&catalog, data_dir.path()).unwrap();
        assert_eq!(report.missing_blobs_found, 1);
    }
}
