//! Object storage for source tarballs and build artifacts.
//!
//! The daemon stores canonical Go source tarballs under `src/` and
//! candidate toolchain artifacts under `out/`. Build workers never talk
//! to the store directly: they receive time-limited presigned URLs for
//! exactly the objects a job may read and write.
//!
//! [`BlobStore`] is the seam; [`FsBlobStore`] keeps objects in a local
//! directory and presigns URLs with an HMAC-SHA256 over
//! `"<method>\n<key>\n<content-type>\n<expiry>"`. The daemon's `/blob/`
//! routes verify the same signature (constant time) before serving.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::hex;

type HmacSha256 = Hmac<Sha256>;

/// Errors from blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    /// I/O failure in the backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No object exists under the key.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The key is empty, absolute, or contains `.` / `..` segments.
    #[error("invalid object key: {0:?}")]
    InvalidKey(String),
}

/// Storage for opaque objects addressed by slash-separated keys.
pub trait BlobStore: Send + Sync {
    /// Stores an object, replacing any previous contents.
    ///
    /// # Errors
    ///
    /// Returns a [`BlobError`] if the key is invalid or the write fails.
    fn put(&self, key: &str, contents: &[u8]) -> Result<(), BlobError>;

    /// Reads an object's contents.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::NotFound`] if the object does not exist.
    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Deletes an object. Deleting a missing object is not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`BlobError`] if the key is invalid or the delete fails.
    fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// Lists keys under a prefix.
    ///
    /// # Errors
    ///
    /// Returns a [`BlobError`] if the listing fails.
    fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError>;

    /// Produces a time-limited URL from which the object can be fetched.
    ///
    /// # Errors
    ///
    /// Returns a [`BlobError`] if the key is invalid.
    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, BlobError>;

    /// Produces a time-limited URL to which an object of the given
    /// content type can be uploaded.
    ///
    /// # Errors
    ///
    /// Returns a [`BlobError`] if the key is invalid.
    fn presign_put(
        &self,
        key: &str,
        ttl: Duration,
        content_type: &str,
    ) -> Result<String, BlobError>;
}

fn check_key(key: &str) -> Result<(), BlobError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}

/// Computes the URL signature for a blob request.
#[must_use]
pub fn sign_request(
    secret: &[u8],
    method: &str,
    key: &str,
    content_type: &str,
    expires: u64,
) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(format!("{method}\n{key}\n{content_type}\n{expires}").as_bytes());
    hex::encode(&mac.finalize().into_bytes())
}

/// Verifies a blob request signature in constant time, including expiry.
#[must_use]
pub fn verify_request(
    secret: &[u8],
    method: &str,
    key: &str,
    content_type: &str,
    expires: u64,
    signature: &str,
    now: u64,
) -> bool {
    if now > expires {
        return false;
    }
    let expected = sign_request(secret, method, key, content_type, expires);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Blob store backed by a local directory, presigning URLs against the
/// daemon's own `/blob/` routes.
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
    secret: Vec<u8>,
}

impl FsBlobStore {
    /// Creates a store rooted at `root`. The directory is created if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns a [`BlobError`] if the root cannot be created.
    pub fn new(
        root: impl Into<PathBuf>,
        base_url: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Result<Self, BlobError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            base_url: base_url.into(),
            secret: secret.into(),
        })
    }

    /// The HMAC secret used for presigned URLs.
    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, BlobError> {
        check_key(key)?;
        Ok(self.root.join(key))
    }

    fn presign(
        &self,
        method: &str,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<String, BlobError> {
        check_key(key)?;
        let expires = unix_now() + ttl.as_secs();
        let signature = sign_request(&self.secret, method, key, content_type, expires);
        let mut url = format!("{}/blob/{key}?expires={expires}&sig={signature}", self.base_url);
        if !content_type.is_empty() {
            url.push_str(&format!("&ct={}", content_type.replace('/', "%2F")));
        }
        Ok(url)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), BlobError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, contents: &[u8]) -> Result<(), BlobError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.object_path(key)?;
        match std::fs::read(path) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            },
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.object_path(key)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let mut keys = Vec::new();
        if self.root.exists() {
            let root = self.root.clone();
            self.walk(&root, &mut keys)?;
        }
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, BlobError> {
        self.presign("GET", key, "", ttl)
    }

    fn presign_put(
        &self,
        key: &str,
        ttl: Duration,
        content_type: &str,
    ) -> Result<String, BlobError> {
        self.presign("PUT", key, content_type, ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(
            dir.path().join("blobs"),
            "https://blobs.example.com",
            b"test-secret".to_vec(),
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_delete_round_trip() {
        let (_dir, store) = store();
        store.put("src/go1.21.0.src.tar.gz", b"tarball").unwrap();
        assert_eq!(store.get("src/go1.21.0.src.tar.gz").unwrap(), b"tarball");

        store.delete("src/go1.21.0.src.tar.gz").unwrap();
        assert!(matches!(
            store.get("src/go1.21.0.src.tar.gz"),
            Err(BlobError::NotFound(_))
        ));
        // Deleting again is a no-op.
        store.delete("src/go1.21.0.src.tar.gz").unwrap();
    }

    #[test]
    fn list_filters_by_prefix() {
        let (_dir, store) = store();
        store.put("out/a.zip", b"a").unwrap();
        store.put("out/a.log", b"a").unwrap();
        store.put("src/s.tar.gz", b"s").unwrap();

        assert_eq!(store.list("out/").unwrap(), vec!["out/a.log", "out/a.zip"]);
        assert_eq!(store.list("src/").unwrap(), vec!["src/s.tar.gz"]);
    }

    #[test]
    fn rejects_traversal_keys() {
        let (_dir, store) = store();
        for bad in ["", "/abs", "a//b", "../escape", "a/../b", "a/./b"] {
            assert!(
                matches!(store.put(bad, b"x"), Err(BlobError::InvalidKey(_))),
                "key {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn presigned_url_verifies_until_expiry() {
        let (_dir, store) = store();
        let url = store
            .presign_get("out/a.zip", Duration::from_secs(60))
            .unwrap();
        assert!(url.starts_with("https://blobs.example.com/blob/out/a.zip?"));

        let expires: u64 = url
            .split("expires=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        let sig = url.split("sig=").nth(1).unwrap().split('&').next().unwrap();

        assert!(verify_request(
            store.secret(),
            "GET",
            "out/a.zip",
            "",
            expires,
            sig,
            expires - 1
        ));
        // Expired.
        assert!(!verify_request(
            store.secret(),
            "GET",
            "out/a.zip",
            "",
            expires,
            sig,
            expires + 1
        ));
        // Wrong method.
        assert!(!verify_request(
            store.secret(),
            "PUT",
            "out/a.zip",
            "",
            expires,
            sig,
            expires - 1
        ));
        // Wrong key.
        assert!(!verify_request(
            store.secret(),
            "GET",
            "out/b.zip",
            "",
            expires,
            sig,
            expires - 1
        ));
    }

    #[test]
    fn put_signature_covers_content_type() {
        let secret = b"s";
        let sig = sign_request(secret, "PUT", "out/a.zip", "application/zip", 100);
        assert!(verify_request(secret, "PUT", "out/a.zip", "application/zip", 100, &sig, 50));
        assert!(!verify_request(secret, "PUT", "out/a.zip", "text/plain", 100, &sig, 50));
    }
}
