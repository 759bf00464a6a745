//! File service: the orchestrator that couples the blob store, the
//! catalog and upload sessions into upload-commit, move, copy, delete and
//! download-preparation semantics.

use std::path::PathBuf;

use crate::blobstore;
use crate::catalog::node::{self, Node, NodeKind, ROOT_ID};
use crate::catalog::Catalog;
use crate::digest::{blob_path, place_blob_or_discard, Digest};
use crate::error::{AppError, AppResult};
use crate::upload::{Finished, UploadSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictStrategy {
    #[default]
    Fail,
    Rename,
    Overwrite,
}

impl ConflictStrategy {
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(|s| s.to_ascii_uppercase()).as_deref() {
            Some("RENAME") => ConflictStrategy::Rename,
            Some("OVERWRITE") => ConflictStrategy::Overwrite,
            _ => ConflictStrategy::Fail,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub node_id: i64,
    pub digest: Digest,
    pub size: u64,
    pub duplicate: bool,
}

pub struct DownloadDescriptor {
    pub path: PathBuf,
    pub size: u64,
    pub name: String,
}

#[derive(Clone)]
pub struct FileService {
    pub catalog: Catalog,
    pub data_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

/// What to do with the just-finished temp file once the transaction that
/// decided its fate has committed.
enum PostCommit {
    Discard,
    Place {
        digest: Digest,
        compensation: Compensation,
    },
}

/// How to undo a commit if placing the blob file on disk fails — the only
/// place the catalog and filesystem can transiently disagree.
enum Compensation {
    NewFile {
        node_id: i64,
    },
    Overwrite {
        node_id: i64,
        old_digest: Digest,
        old_size: u64,
        old_upload_time: i64,
    },
}

impl FileService {
    pub fn new(catalog: Catalog, data_dir: PathBuf, tmp_dir: PathBuf) -> Self {
        Self {
            catalog,
            data_dir,
            tmp_dir,
        }
    }

    pub fn begin_upload(&self) -> UploadSession {
        UploadSession::new(&self.tmp_dir)
    }

    pub async fn resolve(&self, path: String) -> AppResult<Node> {
        self.catalog.resolve(path).await
    }

    pub async fn get_node(&self, id: i64) -> AppResult<Node> {
        self.catalog.get_by_id(id).await
    }

    pub async fn list_children(&self, parent_id: i64) -> AppResult<Vec<Node>> {
        self.catalog.list_children(parent_id).await
    }

    pub async fn create_folder(&self, parent_id: i64, name: String) -> AppResult<i64> {
        self.catalog.insert_folder(parent_id, name).await
    }

    /// Implements the upload-commit algorithm in full: conflict detection,
    /// blob refcounting, metadata write, and the post-commit placement (or
    /// compensation) step.
    pub async fn upload_commit(
        &self,
        parent_id: i64,
        name: String,
        finished: Finished,
    ) -> AppResult<UploadResult> {
        let digest = finished.digest;
        let size = finished.size;
        let plan = self
            .catalog
            .with_tx({
                let name = name.clone();
                move |tx| upload_commit_tx(tx, parent_id, &name, digest, size)
            })
            .await?;

        match plan {
            CommitPlan::Duplicate { node_id } => {
                let _ = tokio::fs::remove_file(&finished.temp_path).await;
                Ok(UploadResult {
                    node_id,
                    digest,
                    size,
                    duplicate: true,
                })
            }
            CommitPlan::NoPlacementNeeded { node_id } => {
                let _ = tokio::fs::remove_file(&finished.temp_path).await;
                Ok(UploadResult {
                    node_id,
                    digest,
                    size,
                    duplicate: false,
                })
            }
            CommitPlan::Place {
                node_id,
                compensation,
            } => {
                let target = blob_path(&self.data_dir, &digest);
                match place_blob_or_discard(&finished.temp_path, &target) {
                    Ok(()) => Ok(UploadResult {
                        node_id,
                        digest,
                        size,
                        duplicate: false,
                    }),
                    Err(io_err) => {
                        self.compensate(compensation).await?;
                        Err(AppError::TransportError(format!(
                            "failed to place blob {digest}: {io_err}"
                        )))
                    }
                }
            }
        }
    }

    async fn compensate(&self, compensation: Compensation) -> AppResult<()> {
        self.catalog
            .with_tx(move |tx| {
                match compensation {
                    Compensation::NewFile { node_id } => {
                        let n = node::get_by_id(tx, node_id)?;
                        if let Some(d) = n.digest {
                            blobstore::decrement(tx, &d)?;
                        }
                        tx.execute("DELETE FROM nodes WHERE id = ?1", rusqlite::params![node_id])?;
                    }
                    Compensation::Overwrite {
                        node_id,
                        old_digest,
                        old_size,
                        old_upload_time,
                    } => {
                        let n = node::get_by_id(tx, node_id)?;
                        if let Some(new_digest) = n.digest {
                            blobstore::decrement(tx, &new_digest)?;
                        }
                        blobstore::insert_or_increment(tx, &old_digest, old_size, old_upload_time)?;
                        node::update_file_content(tx, node_id, &old_digest, old_size, old_upload_time)?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Move with a conflict strategy. Performs the ancestor-walk cycle
    /// check before reparenting.
    pub async fn move_node(
        &self,
        id: i64,
        target_parent_id: i64,
        strategy: ConflictStrategy,
    ) -> AppResult<Node> {
        let removed_blobs = self
            .catalog
            .with_tx(move |tx| move_or_copy_tx(tx, id, target_parent_id, strategy, true))
            .await?;
        self.remove_orphaned_blobs(removed_blobs).await;
        self.catalog.get_by_id(id).await
    }

    /// Copy with a conflict strategy. Never duplicates physical bytes —
    /// every file copy goes through `InsertOrIncrement`.
    pub async fn copy_node(
        &self,
        id: i64,
        target_parent_id: i64,
        strategy: ConflictStrategy,
    ) -> AppResult<i64> {
        let (new_id, removed_blobs) = self
            .catalog
            .with_tx(move |tx| copy_tx(tx, id, target_parent_id, strategy))
            .await?;
        self.remove_orphaned_blobs(removed_blobs).await;
        Ok(new_id)
    }

    /// Deletes `id` (recursively, if a directory) and removes any blob
    /// whose refcount falls to zero.
    pub async fn delete_node(&self, id: i64) -> AppResult<()> {
        let removed_blobs = self
            .catalog
            .with_tx(move |tx| {
                let removed = node::delete_subtree(tx, id)?;
                let mut zeroed = Vec::new();
                for f in removed {
                    if let Some(d) = f.digest {
                        if blobstore::decrement(tx, &d)? == 0 {
                            zeroed.push(d);
                        }
                    }
                }
                Ok(zeroed)
            })
            .await?;
        self.remove_orphaned_blobs(removed_blobs).await;
        Ok(())
    }

    pub async fn prepare_download(&self, id: i64) -> AppResult<DownloadDescriptor> {
        let node = self.catalog.get_by_id(id).await?;
        if node.kind.is_directory() {
            return Err(AppError::IsDirectory(format!("node {id}")));
        }
        let digest = node
            .digest
            .ok_or_else(|| AppError::InvariantViolation(format!("file node {id} has no digest")))?;
        let path = blob_path(&self.data_dir, &digest);
        if !path.exists() {
            return Err(AppError::MissingBlob(digest.to_string()));
        }
        self.catalog.increment_download_count(id).await?;
        Ok(DownloadDescriptor {
            path,
            size: node.size,
            name: node.name,
        })
    }

    async fn remove_orphaned_blobs(&self, digests: Vec<Digest>) {
        for d in digests {
            let path = blob_path(&self.data_dir, &d);
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

enum CommitPlan {
    Duplicate { node_id: i64 },
    NoPlacementNeeded { node_id: i64 },
    Place { node_id: i64, compensation: Compensation },
}

fn upload_commit_tx(
    tx: &rusqlite::Transaction<'_>,
    parent_id: i64,
    name: &str,
    digest: Digest,
    size: u64,
) -> AppResult<CommitPlan> {
    let now = crate::catalog::now_millis();
    let sibling = node::get_by_parent_and_name(tx, parent_id, name)?;
    match sibling {
        None => {
            let outcome = blobstore::insert_or_increment(tx, &digest, size, now)?;
            let node_id = node::insert_file(tx, parent_id, name, &digest, size, now)?;
            if outcome.needs_placement {
                Ok(CommitPlan::Place {
                    node_id,
                    compensation: Compensation::NewFile { node_id },
                })
            } else {
                Ok(CommitPlan::NoPlacementNeeded { node_id })
            }
        }
        Some(sib) if sib.kind.is_directory() => Err(AppError::NameConflict(format!(
            "{name} is a directory under {parent_id}"
        ))),
        Some(sib) if sib.digest == Some(digest) => Ok(CommitPlan::Duplicate { node_id: sib.id }),
        Some(sib) => {
            let old_digest = sib.digest.ok_or_else(|| {
                AppError::InvariantViolation(format!("file node {} has no digest", sib.id))
            })?;
            blobstore::decrement(tx, &old_digest)?;
            let outcome = blobstore::insert_or_increment(tx, &digest, size, now)?;
            node::update_file_content(tx, sib.id, &digest, size, now)?;
            if outcome.needs_placement {
                Ok(CommitPlan::Place {
                    node_id: sib.id,
                    compensation: Compensation::Overwrite {
                        node_id: sib.id,
                        old_digest,
                        old_size: sib.size,
                        old_upload_time: sib.upload_time,
                    },
                })
            } else {
                Ok(CommitPlan::NoPlacementNeeded { node_id: sib.id })
            }
        }
    }
}

/// Appends ` (n)` before the last `.ext` (or at the end if there is none),
/// choosing the smallest `n >= 1` with no sibling collision.
fn next_available_name(
    tx: &rusqlite::Transaction<'_>,
    parent_id: i64,
    base_name: &str,
) -> AppResult<String> {
    let (stem, ext) = match base_name.rfind('.') {
        Some(idx) if idx > 0 => (&base_name[..idx], &base_name[idx..]),
        _ => (base_name, ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if node::get_by_parent_and_name(tx, parent_id, &candidate)?.is_none() {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Shared conflict resolution for move/copy: returns the name the node
/// should land under, deleting an overwritten sibling subtree first and
/// reporting any blobs that fell to zero refcount as a result.
fn resolve_target_name(
    tx: &rusqlite::Transaction<'_>,
    source: &Node,
    target_parent_id: i64,
    strategy: ConflictStrategy,
    exclude_self: bool,
) -> AppResult<(String, Vec<Digest>)> {
    let conflict = node::get_by_parent_and_name(tx, target_parent_id, &source.name)?;
    let conflict = conflict.filter(|c| !(exclude_self && c.id == source.id));
    match conflict {
        None => Ok((source.name.clone(), Vec::new())),
        Some(_) if strategy == ConflictStrategy::Fail => Err(AppError::NameConflict(format!(
            "{} already exists under {target_parent_id}",
            source.name
        ))),
        Some(_) => {
            if strategy == ConflictStrategy::Rename {
                let name = next_available_name(tx, target_parent_id, &source.name)?;
                return Ok((name, Vec::new()));
            }
            let conflict = node::get_by_parent_and_name(tx, target_parent_id, &source.name)?
                .expect("conflict already confirmed present");
            if source.kind.is_directory() || conflict.kind.is_directory() {
                return Err(AppError::BadTarget(
                    "OVERWRITE is only allowed between two files".into(),
                ));
            }
            let removed = node::delete_subtree(tx, conflict.id)?;
            let mut zeroed = Vec::new();
            for f in removed {
                if let Some(d) = f.digest {
                    if blobstore::decrement(tx, &d)? == 0 {
                        zeroed.push(d);
                    }
                }
            }
            Ok((source.name.clone(), zeroed))
        }
    }
}

fn move_or_copy_tx(
    tx: &rusqlite::Transaction<'_>,
    id: i64,
    target_parent_id: i64,
    strategy: ConflictStrategy,
    _is_move: bool,
) -> AppResult<Vec<Digest>> {
    let source = node::get_by_id(tx, id)?;
    let target = node::get_by_id(tx, target_parent_id)?;
    if !target.kind.is_directory() {
        return Err(AppError::BadTarget(format!(
            "target parent {target_parent_id} is not a directory"
        )));
    }
    if node::is_ancestor_or_self(tx, id, target_parent_id)? {
        return Err(AppError::CycleForbidden(format!(
            "cannot move node {id} into its own subtree"
        )));
    }
    let (name, zeroed) = resolve_target_name(tx, &source, target_parent_id, strategy, true)?;
    if source.parent_id != target_parent_id {
        node::reparent(tx, id, target_parent_id, &name)?;
    } else if name != source.name {
        node::rename(tx, id, &name)?;
    }
    Ok(zeroed)
}

fn copy_tx(
    tx: &rusqlite::Transaction<'_>,
    id: i64,
    target_parent_id: i64,
    strategy: ConflictStrategy,
) -> AppResult<(i64, Vec<Digest>)> {
    let source = node::get_by_id(tx, id)?;
    let target = node::get_by_id(tx, target_parent_id)?;
    if !target.kind.is_directory() {
        return Err(AppError::BadTarget(format!(
            "target parent {target_parent_id} is not a directory"
        )));
    }
    let (name, zeroed) = resolve_target_name(tx, &source, target_parent_id, strategy, false)?;
    let now = crate::catalog::now_millis();
    let new_id = copy_recursive(tx, &source, target_parent_id, &name, now)?;
    Ok((new_id, zeroed))
}

fn copy_recursive(
    tx: &rusqlite::Transaction<'_>,
    source: &Node,
    dest_parent_id: i64,
    dest_name: &str,
    now: i64,
) -> AppResult<i64> {
    match source.kind {
        NodeKind::File => {
            let digest = source
                .digest
                .ok_or_else(|| AppError::InvariantViolation(format!("file {} has no digest", source.id)))?;
            blobstore::insert_or_increment(tx, &digest, source.size, now)?;
            node::insert_file(tx, dest_parent_id, dest_name, &digest, source.size, now)
        }
        NodeKind::Directory => {
            let new_id = node::insert_folder(tx, dest_parent_id, dest_name, now)?;
            let mut stack: Vec<(i64, i64)> = node::list_children(tx, source.id)?
                .into_iter()
                .map(|c| (c.id, new_id))
                .collect();
            while let Some((child_id, parent_for_child)) = stack.pop() {
                let child = node::get_by_id(tx, child_id)?;
                match child.kind {
                    NodeKind::File => {
                        let digest = child.digest.ok_or_else(|| {
                            AppError::InvariantViolation(format!("file {} has no digest", child.id))
                        })?;
                        blobstore::insert_or_increment(tx, &digest, child.size, now)?;
                        node::insert_file(tx, parent_for_child, &child.name, &digest, child.size, now)?;
                    }
                    NodeKind::Directory => {
                        let new_child_id =
                            node::insert_folder(tx, parent_for_child, &child.name, now)?;
                        for grandchild in node::list_children(tx, child.id)? {
                            stack.push((grandchild.id, new_child_id));
                        }
                    }
                }
            }
            Ok(new_id)
        }
    }
}

/// `id = 0` is always root; this is exported for adapters that need to
/// reason about the "unnamed" top-level directory without importing the
/// catalog module directly.
pub fn is_root(id: i64) -> bool {
    id == ROOT_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    async fn new_service() -> (FileService, tempfile::TempDir, tempfile::TempDir) {
        let data = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let service = FileService::new(catalog, data.path().to_path_buf(), tmp.path().to_path_buf());
        (service, data, tmp)
    }

    async fn upload(service: &FileService, parent: i64, name: &str, bytes: &[u8]) -> UploadResult {
        let mut session = service.begin_upload();
        session.start().await.unwrap();
        session.process_chunk(bytes).await.unwrap();
        let finished = session.finish().await.unwrap();
        service
            .upload_commit(parent, name.to_string(), finished)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn dedup_shares_one_blob_file() {
        let (service, data, _tmp) = new_service().await;
        let bytes = vec![0u8; 1_048_576];
        let a = upload(&service, ROOT_ID, "a", &bytes).await;
        let b = upload(&service, ROOT_ID, "b", &bytes).await;
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.node_id, b.node_id);

        let rec = service
            .catalog
            .with_tx(move |tx| blobstore::lookup(tx, &a.digest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.refcount, 2);
        assert_eq!(rec.size, 1_048_576);

        let blob_files: Vec<_> = std::fs::read_dir(data.path()).unwrap().collect();
        assert_eq!(blob_files.len(), 1);
    }

    #[tokio::test]
    async fn overwrite_preserves_node_id_and_frees_old_blob() {
        let (service, data, _tmp) = new_service().await;
        let b1 = upload(&service, ROOT_ID, "x", b"one").await;
        let b2 = upload(&service, ROOT_ID, "x", b"two-longer").await;
        assert_eq!(b1.node_id, b2.node_id);
        assert_ne!(b1.digest, b2.digest);

        assert!(!blob_path(data.path(), &b1.digest).exists());
        assert!(blob_path(data.path(), &b2.digest).exists());
    }

    #[tokio::test]
    async fn move_with_rename_conflict_numbers_the_copy() {
        let (service, _data, _tmp) = new_service().await;
        upload(&service, ROOT_ID, "a.txt", b"root version").await;
        let dir = service.create_folder(ROOT_ID, "dir".into()).await.unwrap();
        upload(&service, dir, "a.txt", b"dir version").await;

        let root_file = service
            .resolve("/a.txt".into())
            .await
            .unwrap();
        service
            .move_node(root_file.id, dir, ConflictStrategy::Rename)
            .await
            .unwrap();

        let moved = service.resolve("/dir/a (1).txt".into()).await.unwrap();
        assert_eq!(moved.id, root_file.id);
        let original = service.resolve("/dir/a.txt".into()).await.unwrap();
        assert_ne!(original.id, root_file.id);
    }

    #[tokio::test]
    async fn cycle_rejected() {
        let (service, _data, _tmp) = new_service().await;
        let p = service.create_folder(ROOT_ID, "p".into()).await.unwrap();
        let q = service.create_folder(p, "q".into()).await.unwrap();
        let r = service.create_folder(q, "r".into()).await.unwrap();
        let err = service.move_node(p, r, ConflictStrategy::Fail).await.unwrap_err();
        assert!(matches!(err, AppError::CycleForbidden(_)));
        // Original location is unaffected.
        assert!(service.resolve("/p/q/r".into()).await.is_ok());
    }

    #[tokio::test]
    async fn copy_does_not_duplicate_bytes_on_disk() {
        let (service, data, _tmp) = new_service().await;
        let up = upload(&service, ROOT_ID, "a", b"payload").await;
        let dir = service.create_folder(ROOT_ID, "dir".into()).await.unwrap();
        service
            .copy_node(up.node_id, dir, ConflictStrategy::Fail)
            .await
            .unwrap();

        let rec = service
            .catalog
            .with_tx(move |tx| blobstore::lookup(tx, &up.digest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.refcount, 2);
        let blob_files: Vec<_> = std::fs::read_dir(data.path()).unwrap().collect();
        assert_eq!(blob_files.len(), 1);
    }

    #[tokio::test]
    async fn recursive_delete_removes_subtree_and_blobs() {
        let (service, data, _tmp) = new_service().await;
        let p = service.create_folder(ROOT_ID, "p".into()).await.unwrap();
        for i in 0..5 {
            upload(&service, p, &format!("f{i}"), format!("content-{i}").as_bytes()).await;
        }
        service.delete_node(p).await.unwrap();
        assert!(service.resolve("/p".into()).await.is_err());
        let blob_files: Vec<_> = std::fs::read_dir(data.path()).unwrap().collect();
        assert_eq!(blob_files.len(), 0);
    }

    #[tokio::test]
    async fn upload_same_content_twice_is_idempotent() {
        let (service, _data, _tmp) = new_service().await;
        let first = upload(&service, ROOT_ID, "same", b"bytes").await;
        let second = upload(&service, ROOT_ID, "same", b"bytes").await;
        assert_eq!(first.node_id, second.node_id);
        assert!(second.duplicate);
    }
}
