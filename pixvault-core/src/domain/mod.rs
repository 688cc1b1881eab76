//! Domain records shared by the engine, the queue and the adapters.

/// Photo records and identifiers.
pub mod photo;
/// Collaborator traits.
pub mod ports;
/// Queued work units and pagination.
pub mod task;

pub use photo::{AccountId, BlobKey, Photo, PhotoId, SYSTEM_ACCOUNT_USERNAME};
pub use ports::{
    BinaryFetcher, BlobStore, FetchedBinary, PhotoSource, PhotoStore,
    SaveOutcome, StoredBlob,
};
pub use task::{PageRequest, SearchTask};
