//! Content store abstraction for document payloads and report artifacts.
//!
//! Two reference schemes are understood everywhere a `content_ref` appears:
//!
//! - `inline:<base64>` — small payloads carried directly in the reference,
//!   no round-trip to storage.
//! - `file:<key>` — objects under the configured storage root.
//!
//! The [`ContentStore`] trait is the seam for swapping in a real object
//! store; the filesystem implementation below is what the CLI and server
//! wire up by default.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::StorageConfig;

/// Blob storage used for document content and persisted reports.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Resolve a content reference to its raw bytes.
    async fn get(&self, reference: &str) -> Result<Vec<u8>>;

    /// Store bytes under a key and return the reference to fetch them back.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
}

/// Build an `inline:` reference carrying the payload itself.
pub fn inline_ref(bytes: &[u8]) -> String {
    format!("inline:{}", BASE64.encode(bytes))
}

/// Content-addressed key for a document payload.
pub fn document_key(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("documents/{:x}", hasher.finalize())
}

/// Filesystem-backed content store rooted at `[storage].root`.
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.root.clone(),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        // Keys are internal (hash- or id-derived); reject anything that
        // could escape the root.
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
            bail!("invalid storage key: '{}'", key);
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        if let Some(encoded) = reference.strip_prefix("inline:") {
            return BASE64
                .decode(encoded)
                .context("invalid inline content reference");
        }

        if let Some(key) = reference.strip_prefix("file:") {
            let path = self.object_path(key)?;
            return std::fs::read(&path)
                .with_context(|| format!("failed to read object '{}'", key));
        }

        bail!("unknown content reference scheme: '{}'", reference)
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write object '{}'", key))?;
        Ok(format!("file:{}", key))
    }
}

/// Store a submitted document, inlining small payloads and writing larger
/// ones to the object store under a content-addressed key.
pub async fn store_document(
    store: &dyn ContentStore,
    config: &StorageConfig,
    bytes: &[u8],
) -> Result<String> {
    if bytes.len() <= config.inline_max_bytes {
        Ok(inline_ref(bytes))
    } else {
        store.put(&document_key(bytes), bytes).await
    }
}

/// Resolve the storage root for a config, creating it if missing.
pub fn ensure_root(config: &StorageConfig) -> Result<&Path> {
    std::fs::create_dir_all(&config.root)?;
    Ok(config.root.as_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn storage_config(root: &Path) -> StorageConfig {
        StorageConfig {
            root: root.to_path_buf(),
            inline_max_bytes: 64,
        }
    }

    #[tokio::test]
    async fn inline_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(&storage_config(tmp.path()));

        let reference = inline_ref(b"short document body");
        assert!(reference.starts_with("inline:"));
        let bytes = store.get(&reference).await.unwrap();
        assert_eq!(bytes, b"short document body");
    }

    #[tokio::test]
    async fn file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(&storage_config(tmp.path()));

        let reference = store.put("reports/abc.json", b"{\"ok\":true}").await.unwrap();
        assert_eq!(reference, "file:reports/abc.json");
        let bytes = store.get(&reference).await.unwrap();
        assert_eq!(bytes, b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn large_documents_go_to_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let config = storage_config(tmp.path());
        let store = FsContentStore::new(&config);

        let body = vec![b'x'; 200];
        let reference = store_document(&store, &config, &body).await.unwrap();
        assert!(reference.starts_with("file:documents/"));
        assert_eq!(store.get(&reference).await.unwrap(), body);
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(&storage_config(tmp.path()));

        assert!(store.put("../outside", b"x").await.is_err());
        assert!(store.get("file:../outside").await.is_err());
        assert!(store.get("s3:whatever").await.is_err());
    }
}
