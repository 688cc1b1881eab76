/// cacache-backed blob store.
pub mod blob_store;
/// HTTP binary fetcher.
pub mod download;
/// Postgres photo store.
pub mod postgres;
/// Unsplash API client.
pub mod unsplash;

pub use blob_store::CacheBlobStore;
pub use download::HttpBinaryFetcher;
pub use postgres::PostgresPhotoStore;
pub use unsplash::{UNSPLASH_BASE_URL, UnsplashClient, UnsplashSettings};
