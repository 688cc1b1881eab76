use std::{fmt, sync::Arc};

use pixvault_core::{
    AdmissionGate, IngestionEngine, WorkQueue,
    domain::{BlobStore, PhotoStore},
};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::infra::config::Config;

/// Shared handles for the HTTP handlers.
///
/// `gate` is the same gate the in-process worker uses when the server runs
/// in `all` mode, so both paths share one concurrency bound.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<IngestionEngine>,
    pub store: Arc<dyn PhotoStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: WorkQueue,
    pub gate: AdmissionGate,
    /// Pool checked by `/health`; absent when the store is not Postgres.
    pub database: Option<PgPool>,
    /// Cancelled on shutdown; aborts admission waits of open requests.
    pub shutdown: CancellationToken,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("queue", &self.queue.name())
            .field("admission_capacity", &self.gate.capacity())
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn config(&self) -> &Config {
        &self.config
    }
}
