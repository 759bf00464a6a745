//! Upload session: per-connection ingestion state machine.
//!
//! `Idle -> Receiving -> Finalized | Aborted`. A session is single-threaded
//! — nothing here is `Sync`-shared across tasks — a session never sees
//! concurrent access from more than one connection.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::digest::{new_temp_path, Digest, StreamingHasher};
use crate::error::{AppError, AppResult};

#[derive(Debug)]
enum State {
    Idle,
    Receiving {
        file: tokio::fs::File,
        hasher: StreamingHasher,
    },
    Finalized,
    Aborted,
}

/// The finished product of a session: where the bytes landed, their digest,
/// and their length.
pub struct Finished {
    pub temp_path: PathBuf,
    pub digest: Digest,
    pub size: u64,
}

pub struct UploadSession {
    tmp_dir: PathBuf,
    temp_path: Option<PathBuf>,
    state: State,
}

impl UploadSession {
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            temp_path: None,
            state: State::Idle,
        }
    }

    /// Creates a unique temp file and initializes the hasher/counter.
    pub async fn start(&mut self) -> AppResult<()> {
        if !matches!(self.state, State::Idle) {
            return Err(AppError::BadRequest(
                "upload session already started".into(),
            ));
        }
        let path = new_temp_path(&self.tmp_dir);
        let file = tokio::fs::File::create(&path).await?;
        self.temp_path = Some(path);
        self.state = State::Receiving {
            file,
            hasher: StreamingHasher::new(),
        };
        Ok(())
    }

    /// Feeds one chunk to the hasher and the temp file, in lockstep. A
    /// partial failure of either write is fatal to the session.
    pub async fn process_chunk(&mut self, chunk: &[u8]) -> AppResult<()> {
        let State::Receiving { file, hasher } = &mut self.state else {
            return Err(AppError::BadRequest(
                "upload session is not receiving".into(),
            ));
        };
        hasher.update(chunk);
        if let Err(e) = file.write_all(chunk).await {
            self.state = State::Aborted;
            return Err(e.into());
        }
        Ok(())
    }

    /// Flushes and closes the temp file, returning its digest and size.
    pub async fn finish(&mut self) -> AppResult<Finished> {
        if !matches!(self.state, State::Receiving { .. }) {
            return Err(AppError::BadRequest(
                "upload session is not receiving".into(),
            ));
        }
        let State::Receiving { mut file, hasher } =
            std::mem::replace(&mut self.state, State::Finalized)
        else {
            unreachable!("checked above");
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        let size = hasher.bytes_seen();
        let digest = hasher.finalize();
        let temp_path = self
            .temp_path
            .clone()
            .ok_or_else(|| AppError::BadRequest("upload session never started".into()))?;
        Ok(Finished {
            temp_path,
            digest,
            size,
        })
    }

    /// Closes the handle and deletes the temp file, absorbing I/O failures.
    pub async fn abort(&mut self) {
        self.state = State::Aborted;
        if let Some(path) = self.temp_path.take() {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    pub fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn happy_path_hashes_and_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = UploadSession::new(dir.path());
        session.start().await.unwrap();
        session.process_chunk(b"hello ").await.unwrap();
        session.process_chunk(b"world").await.unwrap();
        let finished = session.finish().await.unwrap();
        assert_eq!(finished.size, 11);
        let mut h = StreamingHasher::new();
        h.update(b"hello world");
        assert_eq!(finished.digest, h.finalize());
        assert!(finished.temp_path.exists());
    }

    #[tokio::test]
    async fn abort_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = UploadSession::new(dir.path());
        session.start().await.unwrap();
        session.process_chunk(b"partial").await.unwrap();
        let path = session.temp_path().unwrap().to_path_buf();
        session.abort().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn process_chunk_before_start_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = UploadSession::new(dir.path());
        let err = session.process_chunk(b"x").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
