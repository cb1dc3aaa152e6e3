//! Content-addressed blob storage.
//!
//! Blobs live as `blobs/<base32(digest)>` files; the digest is the SHA-1 of
//! the plaintext, written as `sha1-<base32>`. Writes stream into a temp
//! file and atomically rename into place once the digest is known, so
//! concurrent writers of the same content are idempotent.

use std::io::Write;
use std::path::{Path, PathBuf};

use base32::Alphabet;
use rivetdb_core::error::{Result, RivetError};
use rivetdb_replication::BlobAccess;
use sha1::{Digest, Sha1};
use tracing::debug;

const DIGEST_PREFIX: &str = "sha1-";
const BASE32: Alphabet = Alphabet::Rfc4648 { padding: false };

pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<BlobStore> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(BlobStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The digest string for some content.
    pub fn digest_of(data: &[u8]) -> String {
        let digest = Sha1::digest(data);
        format!("{DIGEST_PREFIX}{}", base32::encode(BASE32, &digest))
    }

    fn path_for(&self, digest: &str) -> Result<PathBuf> {
        let encoded = digest.strip_prefix(DIGEST_PREFIX).ok_or_else(|| {
            RivetError::InvalidParameter(format!("bad blob digest {digest:?}"))
        })?;
        if encoded.is_empty() || !encoded.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(RivetError::InvalidParameter(format!(
                "bad blob digest {digest:?}"
            )));
        }
        Ok(self.dir.join(encoded))
    }

    /// Stores a blob, returning its digest. Installing content that already
    /// exists is a no-op.
    pub fn put(&self, data: &[u8]) -> Result<String> {
        let digest = Self::digest_of(data);
        let target = self.path_for(&digest)?;
        if target.exists() {
            return Ok(digest);
        }
        let temp = self
            .dir
            .join(format!("incoming-{}", uuid::Uuid::new_v4().simple()));
        {
            let mut file = std::fs::File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        match std::fs::rename(&temp, &target) {
            Ok(()) => {}
            Err(e) => {
                let _ = std::fs::remove_file(&temp);
                // A concurrent writer may have installed it first.
                if !target.exists() {
                    return Err(e.into());
                }
            }
        }
        debug!(%digest, "blob installed");
        Ok(digest)
    }

    pub fn get(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.path_for(digest)?;
        let data = std::fs::read(&path)
            .map_err(|_| RivetError::NotFound(format!("blob {digest}")))?;
        // Verify on the way out too; a corrupted file must not pass as its
        // claimed digest.
        if Self::digest_of(&data) != digest {
            return Err(RivetError::CryptoError(format!(
                "blob {digest} failed digest verification"
            )));
        }
        Ok(data)
    }

    pub fn has(&self, digest: &str) -> bool {
        self.path_for(digest).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn delete(&self, digest: &str) -> Result<bool> {
        let path = self.path_for(digest)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl BlobAccess for BlobStore {
    fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        self.get(digest)
    }

    fn put_blob(&self, data: &[u8]) -> Result<String> {
        self.put(data)
    }

    fn has_blob(&self, digest: &str) -> bool {
        self.has(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = store();
        let digest = store.put(b"hello blobs").unwrap();
        assert!(digest.starts_with(DIGEST_PREFIX));
        assert!(store.has(&digest));
        assert_eq!(store.get(&digest).unwrap(), b"hello blobs");
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let a = store.put(b"same content").unwrap();
        let b = store.put(b"same content").unwrap();
        assert_eq!(a, b);
        let c = store.put(b"other content").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn missing_and_malformed_digests() {
        let (_dir, store) = store();
        let missing = BlobStore::digest_of(b"never stored");
        assert!(!store.has(&missing));
        assert!(matches!(store.get(&missing), Err(RivetError::NotFound(_))));
        assert!(store.get("md5-nope").is_err());
        assert!(store.get("sha1-../../etc/passwd").is_err());
    }

    #[test]
    fn corrupted_blob_detected() {
        let (_dir, store) = store();
        let digest = store.put(b"pristine").unwrap();
        let path = store.path_for(&digest).unwrap();
        std::fs::write(path, b"tampered").unwrap();
        assert!(matches!(store.get(&digest), Err(RivetError::CryptoError(_))));
    }

    #[test]
    fn delete_removes_blob() {
        let (_dir, store) = store();
        let digest = store.put(b"to delete").unwrap();
        assert!(store.delete(&digest).unwrap());
        assert!(!store.delete(&digest).unwrap());
        assert!(!store.has(&digest));
    }
}
