//! Collaborator contracts consumed by the ingestion engine.
//!
//! Production adapters live in [`crate::infra`]; tests provide in-memory
//! doubles implementing the same traits.

use async_trait::async_trait;

use crate::domain::photo::{AccountId, BlobKey, Photo, PhotoId};
use crate::domain::task::PageRequest;
use crate::error::{BlobError, DownloadError, SourceError, StoreError};

/// Upstream photo catalog.
#[async_trait]
pub trait PhotoSource: Send + Sync {
    /// Fetch one photo; an unknown id is [`SourceError::NotFound`].
    async fn fetch_by_id(&self, external_id: &str)
    -> Result<Photo, SourceError>;

    /// Search the catalog. An empty result is not an error.
    async fn search(
        &self,
        query: &str,
        page: PageRequest,
    ) -> Result<Vec<Photo>, SourceError>;

    /// Newest photos published on the catalog.
    async fn list_new(
        &self,
        page: PageRequest,
    ) -> Result<Vec<Photo>, SourceError>;
}

/// A downloaded binary with the content type announced by the origin.
#[derive(Clone, Debug)]
pub struct FetchedBinary {
    /// Response body.
    pub bytes: Vec<u8>,
    /// `Content-Type` header, if any.
    pub content_type: Option<String>,
}

/// Downloads photo binaries from their source URL.
#[async_trait]
pub trait BinaryFetcher: Send + Sync {
    /// Download `url`. Non-2xx answers are [`DownloadError::Status`](crate::error::DownloadError::Status).
    async fn fetch(&self, url: &str) -> Result<FetchedBinary, DownloadError>;
}

/// A binary read back from the blob store.
#[derive(Clone, Debug)]
pub struct StoredBlob {
    /// Object content.
    pub bytes: Vec<u8>,
    /// Content type recorded at upload.
    pub content_type: String,
}

/// Object storage for photo binaries, addressed by key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object, and return
    /// the URL the object is served from.
    async fn upload(
        &self,
        key: &BlobKey,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BlobError>;

    /// Read an object back.
    async fn get(&self, key: &BlobKey) -> Result<StoredBlob, BlobError>;

    /// Remove the object; removing a missing key succeeds.
    async fn delete(&self, key: &BlobKey) -> Result<(), BlobError>;
}

/// Result of [`PhotoStore::save`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The record was written.
    Inserted,
    /// Another record with the same external id won the race; re-read it.
    AlreadyExists,
}

/// Persistent photo metadata and the owning system account.
#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// Insert a new record. An existing external id is reported, not overwritten.
    async fn save(&self, photo: &Photo) -> Result<SaveOutcome, StoreError>;

    /// Lookup by internal id.
    async fn get_by_internal_id(
        &self,
        id: PhotoId,
    ) -> Result<Option<Photo>, StoreError>;

    /// Lookup by upstream id.
    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Photo>, StoreError>;

    /// Case-insensitive substring search over title, description and author,
    /// newest first.
    async fn search(
        &self,
        query: &str,
        page: PageRequest,
    ) -> Result<Vec<Photo>, StoreError>;

    /// Most recently stored photos first.
    async fn list_recent(
        &self,
        page: PageRequest,
    ) -> Result<Vec<Photo>, StoreError>;

    /// Id of the sentinel account, creating it on first use. Concurrent first
    /// calls must agree on one account.
    async fn get_or_create_system_account(
        &self,
    ) -> Result<AccountId, StoreError>;
}
