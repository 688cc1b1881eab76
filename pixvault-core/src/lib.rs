//! # pixvault core
//!
//! Ingestion pipeline for the pixvault photo service: pulls photo metadata
//! and binaries from an upstream catalog, stores binaries in a blob store and
//! persists metadata in PostgreSQL.
//!
//! ## Architecture
//!
//! - [`domain`]: photo records, the queued [`SearchTask`](domain::SearchTask)
//!   and the collaborator traits ([`PhotoSource`](domain::PhotoSource),
//!   [`BlobStore`](domain::BlobStore), [`PhotoStore`](domain::PhotoStore),
//!   [`BinaryFetcher`](domain::BinaryFetcher)).
//! - [`ingest`]: the [`IngestionEngine`](ingest::IngestionEngine) with its
//!   per-batch reports and process-wide failure counters.
//! - [`queue`]: the [`WorkQueue`](queue::WorkQueue) producer/consumer protocol
//!   over a [`QueueBroker`](queue::QueueBroker) (Postgres or in-memory).
//! - [`admission`]: the shared [`AdmissionGate`](admission::AdmissionGate).
//! - [`worker`]: the consumer loop binding the queue to the engine.
//! - [`infra`]: production adapters (Unsplash, HTTP downloads, cacache blobs,
//!   Postgres photo store).

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Bounded-concurrency admission control.
pub mod admission;

/// Domain records and collaborator traits.
pub mod domain;

/// Error types and error handling utilities
pub mod error;

/// Infrastructure adapters for the collaborator traits.
pub mod infra;

/// The ingestion engine.
pub mod ingest;

/// Durable work queue.
pub mod queue;

/// Queue consumer loop.
pub mod worker;

pub use admission::{AdmissionGate, AdmissionSlot};
pub use error::{IngestError, Result};
pub use ingest::IngestionEngine;
pub use queue::WorkQueue;

/// Schema migrations for the photo store and the Postgres queue broker.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
