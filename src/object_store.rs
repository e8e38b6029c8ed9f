//! Object storage collaborator.
//!
//! The pipeline only needs `put`/`get`/`delete` plus presigned download
//! URLs. [`FsObjectStore`] keeps objects under a root directory and signs
//! URLs with HMAC-SHA256; a real bucket store slots in behind the trait.

use std::path::PathBuf;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::error::{Result, TidepoolError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, locator: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, locator: &str) -> Result<Vec<u8>>;

    /// Returns `false` when the object was already gone.
    async fn delete(&self, locator: &str) -> Result<bool>;

    fn presigned_download_url(&self, locator: &str, ttl_secs: u64) -> Result<String>;
}

pub struct FsObjectStore {
    root: PathBuf,
    signing_key: Vec<u8>,
}

impl FsObjectStore {
    pub fn new(root: PathBuf, signing_key: &str) -> Self {
        Self {
            root,
            signing_key: signing_key.as_bytes().to_vec(),
        }
    }

    fn object_path(&self, locator: &str) -> Result<PathBuf> {
        if locator.is_empty()
            || locator.contains('/')
            || locator.contains('\\')
            || locator.contains("..")
        {
            return Err(TidepoolError::Validation(format!(
                "invalid storage locator: {locator:?}"
            )));
        }
        Ok(self.root.join(locator))
    }

    fn sign(&self, message: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.signing_key)
            .map_err(|e| TidepoolError::Validation(format!("bad signing key: {e}")))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(locator)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, bytes).await?;
        debug!(locator, bytes = bytes.len(), "object stored");
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        let path = self.object_path(locator)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TidepoolError::NotFound(format!("object {locator}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let path = self.object_path(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn presigned_download_url(&self, locator: &str, ttl_secs: u64) -> Result<String> {
        let path = self.object_path(locator)?;
        let expires = chrono::Utc::now().timestamp() + ttl_secs as i64;
        let signature = self.sign(&format!("{locator}:{expires}"))?;
        Ok(format!(
            "file://{}?expires={expires}&signature={signature}",
            path.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf(), "test-key");
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let (_dir, store) = store();
        store.put("abc123", b"payload").await.unwrap();
        assert_eq!(store.get("abc123").await.unwrap(), b"payload");
        assert!(store.delete("abc123").await.unwrap());
        assert!(!store.delete("abc123").await.unwrap());
        assert!(matches!(
            store.get("abc123").await.unwrap_err(),
            TidepoolError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn path_traversal_locators_rejected() {
        let (_dir, store) = store();
        for locator in ["../etc/passwd", "a/b", "", "a\\b"] {
            assert!(matches!(
                store.get(locator).await.unwrap_err(),
                TidepoolError::Validation(_)
            ));
        }
    }

    #[tokio::test]
    async fn presigned_url_is_stable_for_same_expiry() {
        let (_dir, store) = store();
        let url = store.presigned_download_url("abc123", 3600).unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.contains("signature="));
        assert!(url.contains("expires="));
    }
}
