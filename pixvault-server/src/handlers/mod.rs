pub mod blobs;
pub mod ops;
pub mod photos;
