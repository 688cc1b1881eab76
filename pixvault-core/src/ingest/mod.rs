//! Photo ingestion: dedup, download, blob upload and persistence.

/// The ingestion pipeline.
pub mod engine;
/// Batch reports and counters.
pub mod report;

pub use engine::{DEFAULT_CONTENT_TYPE, IngestionEngine};
pub use report::{
    FailureKind, FailureRecord, IngestReport, IngestStats, IngestStatsSnapshot,
    SkippedItem,
};
