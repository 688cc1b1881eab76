use std::{
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{
    domain::{BlobKey, BlobStore, StoredBlob},
    error::BlobError,
    ingest::DEFAULT_CONTENT_TYPE,
};

/// Blob store over a local `cacache` directory.
///
/// Objects are addressed by [`BlobKey`]; the content type is kept in the
/// index entry's metadata. Writing an existing key replaces the entry.
#[derive(Clone)]
pub struct CacheBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl fmt::Debug for CacheBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBlobStore")
            .field("root", &self.root)
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

impl CacheBlobStore {
    /// `public_base_url` is the prefix under which the server exposes blobs,
    /// e.g. `http://localhost:3000/blobs`.
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Public URL an object is served from.
    pub fn url_for(&self, key: &BlobKey) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

fn map_cache_error(key: &BlobKey, err: cacache::Error) -> BlobError {
    match err {
        cacache::Error::EntryNotFound(_, _) => {
            BlobError::NotFound(key.to_string())
        }
        cacache::Error::IntegrityError(err) => {
            BlobError::Integrity(format!("{key} ({err})"))
        }
        cacache::Error::SizeMismatch(wanted, actual) => BlobError::Integrity(
            format!("{key}: size mismatch, wanted={wanted}, actual={actual}"),
        ),
        cacache::Error::IoError(_, msg) => {
            BlobError::Backend(format!("cacache I/O error for {key}: {msg}"))
        }
        cacache::Error::SerdeError(_, msg) => {
            BlobError::Backend(format!("cacache index error for {key}: {msg}"))
        }
    }
}

#[async_trait]
impl BlobStore for CacheBlobStore {
    async fn upload(
        &self,
        key: &BlobKey,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BlobError> {
        let mut writer = cacache::WriteOpts::new()
            .size(bytes.len())
            .metadata(json!({ "content_type": content_type }))
            .open(&self.root, key.as_str())
            .await
            .map_err(|e| map_cache_error(key, e))?;

        writer.write_all(&bytes).await.map_err(|e| {
            BlobError::Backend(format!("cacache write failed for {key}: {e}"))
        })?;
        let integrity = writer
            .commit()
            .await
            .map_err(|e| map_cache_error(key, e))?;

        debug!(key = %key, size = bytes.len(), %integrity, "blob stored");
        Ok(self.url_for(key))
    }

    async fn get(&self, key: &BlobKey) -> Result<StoredBlob, BlobError> {
        let meta = cacache::metadata(&self.root, key.as_str())
            .await
            .map_err(|e| map_cache_error(key, e))?
            .ok_or_else(|| BlobError::NotFound(key.to_string()))?;

        let content_type = meta
            .metadata
            .get("content_type")
            .and_then(|value| value.as_str())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let bytes = cacache::read(&self.root, key.as_str())
            .await
            .map_err(|e| map_cache_error(key, e))?;

        Ok(StoredBlob {
            bytes,
            content_type,
        })
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), BlobError> {
        let exists = cacache::metadata(&self.root, key.as_str())
            .await
            .map_err(|e| map_cache_error(key, e))?
            .is_some();
        if !exists {
            return Ok(());
        }

        cacache::index::RemoveOpts::new()
            .remove_fully(true)
            .remove(&self.root, key.as_str())
            .await
            .map_err(|e| map_cache_error(key, e))
    }
}
