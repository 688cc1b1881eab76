use std::time::Duration;

use thiserror::Error;

use crate::ingest::FailureKind;

/// Errors reported by a [`PhotoSource`](crate::domain::PhotoSource).
#[derive(Error, Debug)]
pub enum SourceError {
    /// Upstream has no photo with this id.
    #[error("photo not found upstream: {0}")]
    NotFound(String),

    /// Non-success response not covered by a more specific variant.
    #[error("upstream API error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// Upstream rejected the access key.
    #[error("invalid upstream API key")]
    InvalidApiKey,

    /// Upstream answered 429.
    #[error("upstream rate limit exceeded")]
    RateLimited,

    /// HTTP client failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The response body did not decode.
    #[error("failed to decode upstream response: {0}")]
    Parse(String),

    /// Settings rejected at construction.
    #[error("invalid source configuration: {0}")]
    Config(String),
}

/// Errors reported by a [`BinaryFetcher`](crate::domain::BinaryFetcher).
#[derive(Error, Debug)]
pub enum DownloadError {
    /// The request never produced a response.
    #[error("download of {url} failed: {message}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Transport error text.
        message: String,
    },

    /// The server answered with a non-2xx status.
    #[error("download of {url} returned status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
}

/// Errors reported by a [`BlobStore`](crate::domain::BlobStore).
#[derive(Error, Debug)]
pub enum BlobError {
    /// No blob under this key.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Stored content does not match its recorded digest.
    #[error("blob integrity check failed: {0}")]
    Integrity(String),

    /// Cache or filesystem failure.
    #[error("blob store error: {0}")]
    Backend(String),
}

/// Errors reported by a [`PhotoStore`](crate::domain::PhotoStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQL driver failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failure from a non-SQL backend.
    #[error("store error: {0}")]
    Backend(String),
}

/// Failures of the ingestion pipeline. Every variant wraps the collaborator
/// error that caused it; none of them are retried inside the engine.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum IngestError {
    /// Checking the store for an existing record failed.
    #[error("dedup lookup for {external_id} failed: {source}")]
    DedupLookupFailed {
        external_id: String,
        #[source]
        source: StoreError,
    },

    /// Upstream answered that the photo does not exist.
    #[error("photo {external_id} is unknown upstream")]
    SourceNotFound {
        external_id: String,
        #[source]
        source: SourceError,
    },

    /// Any other photo source failure.
    #[error("photo source request failed: {source}")]
    SourceFetchFailed {
        #[source]
        source: SourceError,
    },

    /// The binary could not be fetched.
    #[error("binary download failed: {source}")]
    BinaryDownloadFailed {
        #[source]
        source: DownloadError,
    },

    /// The binary URL answered with a non-2xx status.
    #[error("unexpected download status: {source}")]
    UnexpectedDownloadStatus {
        #[source]
        source: DownloadError,
    },

    /// Writing the binary to the blob store failed.
    #[error("blob upload for {external_id} failed: {source}")]
    BlobUploadFailed {
        external_id: String,
        #[source]
        source: BlobError,
    },

    /// The system owner account could not be found or created.
    #[error("system account resolution failed: {source}")]
    AccountResolutionFailed {
        #[source]
        source: StoreError,
    },

    /// Saving the photo record failed.
    #[error("persisting photo {external_id} failed: {source}")]
    PersistFailed {
        external_id: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    /// Stable classification used by reports and counters.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DedupLookupFailed { .. } => FailureKind::DedupLookupFailed,
            Self::SourceNotFound { .. } => FailureKind::SourceNotFound,
            Self::SourceFetchFailed { .. } => FailureKind::SourceFetchFailed,
            Self::BinaryDownloadFailed { .. } => {
                FailureKind::BinaryDownloadFailed
            }
            Self::UnexpectedDownloadStatus { .. } => {
                FailureKind::UnexpectedDownloadStatus
            }
            Self::BlobUploadFailed { .. } => FailureKind::BlobUploadFailed,
            Self::AccountResolutionFailed { .. } => {
                FailureKind::AccountResolutionFailed
            }
            Self::PersistFailed { .. } => FailureKind::PersistFailed,
        }
    }

    pub(crate) fn from_download(source: DownloadError) -> Self {
        match source {
            DownloadError::Status { .. } => {
                Self::UnexpectedDownloadStatus { source }
            }
            DownloadError::Transport { .. } => {
                Self::BinaryDownloadFailed { source }
            }
        }
    }
}

/// Errors raised by the work queue and its brokers.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The task could not be encoded.
    #[error("task serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Publish was not confirmed in time and was not enqueued.
    #[error("publish did not complete within {0:?}")]
    PublishTimeout(Duration),

    /// The broker stopped accepting work.
    #[error("queue is closed")]
    Closed,

    /// SQL driver failure.
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Broker failure outside the database driver.
    #[error("queue error: {0}")]
    Internal(String),
}

/// Outcomes of an [`AdmissionGate`](crate::admission::AdmissionGate)
/// acquisition that did not grant a slot.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// The caller's cancellation token fired first.
    #[error("admission wait was cancelled")]
    Cancelled,

    /// The wait deadline passed.
    #[error("no admission slot became free within {0:?}")]
    TimedOut(Duration),

    /// The gate was shut down.
    #[error("admission gate is closed")]
    Closed,
}

/// Result of an ingestion operation.
pub type Result<T> = std::result::Result<T, IngestError>;
