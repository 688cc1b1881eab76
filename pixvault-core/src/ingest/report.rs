use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Photo;
use crate::error::IngestError;

/// Number of failure records retained by [`IngestStats`].
pub const RECENT_FAILURE_CAPACITY: usize = 64;

/// Classification of ingestion failures.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// See [`IngestError::DedupLookupFailed`].
    DedupLookupFailed,
    /// See [`IngestError::SourceNotFound`].
    SourceNotFound,
    /// See [`IngestError::SourceFetchFailed`].
    SourceFetchFailed,
    /// See [`IngestError::BinaryDownloadFailed`].
    BinaryDownloadFailed,
    /// See [`IngestError::UnexpectedDownloadStatus`].
    UnexpectedDownloadStatus,
    /// See [`IngestError::BlobUploadFailed`].
    BlobUploadFailed,
    /// See [`IngestError::AccountResolutionFailed`].
    AccountResolutionFailed,
    /// See [`IngestError::PersistFailed`].
    PersistFailed,
}

impl FailureKind {
    /// Every kind, in counter order.
    pub const ALL: [FailureKind; 8] = [
        FailureKind::DedupLookupFailed,
        FailureKind::SourceNotFound,
        FailureKind::SourceFetchFailed,
        FailureKind::BinaryDownloadFailed,
        FailureKind::UnexpectedDownloadStatus,
        FailureKind::BlobUploadFailed,
        FailureKind::AccountResolutionFailed,
        FailureKind::PersistFailed,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Snake-case name used in logs and JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DedupLookupFailed => "dedup_lookup_failed",
            Self::SourceNotFound => "source_not_found",
            Self::SourceFetchFailed => "source_fetch_failed",
            Self::BinaryDownloadFailed => "binary_download_failed",
            Self::UnexpectedDownloadStatus => "unexpected_download_status",
            Self::BlobUploadFailed => "blob_upload_failed",
            Self::AccountResolutionFailed => "account_resolution_failed",
            Self::PersistFailed => "persist_failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch item that was dropped from the result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkippedItem {
    /// Upstream id of the dropped photo.
    pub external_id: String,
    /// Failure class.
    pub kind: FailureKind,
    /// Error text.
    pub reason: String,
}

/// Outcome of one search-and-persist batch.
#[derive(Clone, Debug, Default)]
pub struct IngestReport {
    /// Number of results returned by the source.
    pub found: usize,
    /// Resolved records, in source order.
    pub photos: Vec<Photo>,
    /// Results that already existed in the store.
    pub reused: usize,
    /// Results ingested by this batch.
    pub ingested: usize,
    /// Results dropped after a per-item failure.
    pub skipped: Vec<SkippedItem>,
}

impl IngestReport {
    /// True when nothing was skipped.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// A single failure kept for inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Upstream id, when the failure concerned one photo.
    pub external_id: Option<String>,
    /// Failure class.
    pub kind: FailureKind,
    /// Error text.
    pub reason: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Process-wide ingestion counters.
///
/// Updated by the engine on every operation; read through
/// [`IngestStats::snapshot`].
#[derive(Default)]
pub struct IngestStats {
    resolved_from_store: AtomicU64,
    ingested: AtomicU64,
    batches: AtomicU64,
    skipped: AtomicU64,
    failures: [AtomicU64; 8],
    recent: Mutex<VecDeque<FailureRecord>>,
}

impl fmt::Debug for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestStats")
            .field(
                "resolved_from_store",
                &self.resolved_from_store.load(Ordering::Relaxed),
            )
            .field("ingested", &self.ingested.load(Ordering::Relaxed))
            .field("batches", &self.batches.load(Ordering::Relaxed))
            .field("skipped", &self.skipped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Serializable view of [`IngestStats`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestStatsSnapshot {
    /// Lookups answered from the store.
    pub resolved_from_store: u64,
    /// Photos ingested.
    pub ingested: u64,
    /// Search batches run.
    pub batches: u64,
    /// Batch items skipped.
    pub skipped: u64,
    /// Failure counts by kind.
    pub failures: BTreeMap<FailureKind, u64>,
    /// Newest failures last.
    pub recent_failures: Vec<FailureRecord>,
}

impl IngestStatsSnapshot {
    /// Count for one kind.
    pub fn failures_of(&self, kind: FailureKind) -> u64 {
        self.failures.get(&kind).copied().unwrap_or(0)
    }
}

impl IngestStats {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_reused(&self) {
        self.resolved_from_store.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ingested(&self) {
        self.ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, report: &IngestReport) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.skipped
            .fetch_add(report.skipped.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(
        &self,
        external_id: Option<&str>,
        err: &IngestError,
    ) {
        let kind = err.kind();
        self.failures[kind.index()].fetch_add(1, Ordering::Relaxed);

        let record = FailureRecord {
            external_id: external_id.map(str::to_owned),
            kind,
            reason: err.to_string(),
            at: Utc::now(),
        };
        let mut recent = self
            .recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if recent.len() == RECENT_FAILURE_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Copy the counters out.
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        let failures = FailureKind::ALL
            .iter()
            .map(|kind| {
                (*kind, self.failures[kind.index()].load(Ordering::Relaxed))
            })
            .collect();
        let recent_failures = self
            .recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .cloned()
            .collect();

        IngestStatsSnapshot {
            resolved_from_store: self
                .resolved_from_store
                .load(Ordering::Relaxed),
            ingested: self.ingested.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures,
            recent_failures,
        }
    }
}
