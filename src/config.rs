//! Process-level configuration.
//!
//! The bound port is the only externally meaningful parameter; the
//! data/tmp/db locations are read from environment variables with an
//! `unwrap_or_else` defaulting style but are otherwise ordinary
//! constructor parameters — never reached for as ambient globals.

use std::path::{Path, PathBuf};

use path_absolutize::Absolutize;

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub data_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub db_path: PathBuf,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let port: u16 = std::env::var("HYPERFS_PORT")
            .unwrap_or_else(|_| "7980".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid HYPERFS_PORT: {e}"))?;
        let data_dir = std::env::var("HYPERFS_DATA_DIR").unwrap_or_else(|_| "data/blobs".into());
        let tmp_dir = std::env::var("HYPERFS_TMP_DIR").unwrap_or_else(|_| "data/tmp".into());
        let db_path =
            std::env::var("HYPERFS_DB_PATH").unwrap_or_else(|_| "data/hyperfs.db".into());
        Ok(Self::new(port, data_dir, tmp_dir, db_path)?)
    }

    pub fn new(
        port: u16,
        data_dir: impl AsRef<Path>,
        tmp_dir: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            port,
            data_dir: absolutize(data_dir.as_ref())?,
            tmp_dir: absolutize(tmp_dir.as_ref())?,
            db_path: absolutize(db_path.as_ref())?,
        })
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.tmp_dir)?;
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

fn absolutize(p: &Path) -> anyhow::Result<PathBuf> {
    Ok(p.absolutize()?.to_path_buf())
}
