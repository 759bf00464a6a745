//! Digest & I/O primitives: SHA-256 streaming hasher, atomic rename,
//! and temp-file arena for in-flight uploads.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

/// A 256-bit content digest, rendered as 64 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Filename this digest is stored under in the data directory.
    pub fn filename(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("bad digest: {0}")]
pub struct BadDigest(pub String);

impl FromStr for Digest {
    type Err = BadDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BadDigest(s.to_string()));
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let byte_str = std::str::from_utf8(chunk).map_err(|_| BadDigest(s.to_string()))?;
            out[i] = u8::from_str_radix(byte_str, 16).map_err(|_| BadDigest(s.to_string()))?;
        }
        Ok(Digest(out))
    }
}

/// Incremental SHA-256 hasher used by the upload session: the same bytes
/// that are appended to the temp file are fed here, in lockstep.
#[derive(Default)]
pub struct StreamingHasher {
    inner: Sha256,
    bytes_seen: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes_seen += chunk.len() as u64;
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    pub fn finalize(self) -> Digest {
        let out = self.inner.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&out);
        Digest(bytes)
    }
}

/// Path a blob with this digest would live at under `data_dir`.
pub fn blob_path(data_dir: &Path, digest: &Digest) -> PathBuf {
    data_dir.join(digest.filename())
}

/// Generates a unique temp-file path under `tmp_dir`, named
/// `upload_<uuid>.tmp`.
pub fn new_temp_path(tmp_dir: &Path) -> PathBuf {
    tmp_dir.join(format!("upload_{}.tmp", uuid::Uuid::new_v4()))
}

/// Renames `from` into place at `to`, treating "destination already exists"
/// as benign — a concurrent upload of identical content may have already
/// placed the same blob.
pub fn place_blob_or_discard(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if to.exists() => {
            let _ = e;
            std::fs::remove_file(from).ok();
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_round_trips_through_display_and_from_str() {
        let mut h = StreamingHasher::new();
        h.update(b"hello world");
        let d = h.finalize();
        let s = d.to_string();
        assert_eq!(s.len(), 64);
        let parsed: Digest = s.parse().unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn rejects_wrong_length_and_non_hex() {
        assert!("abc".parse::<Digest>().is_err());
        assert!("z".repeat(64).parse::<Digest>().is_err());
    }

    #[test]
    fn known_sha256_of_empty_string() {
        let h = StreamingHasher::new();
        let d = h.finalize();
        assert_eq!(
            d.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
        );
    }
}
