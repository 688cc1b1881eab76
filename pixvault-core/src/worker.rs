//! Queue consumers feeding search tasks into the ingestion engine.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    admission::AdmissionGate,
    domain::SearchTask,
    error::{AdmissionError, IngestError, QueueError},
    ingest::IngestionEngine,
    queue::{ConsumeSummary, TaskFailure, WorkQueue},
};

/// Consumer settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent consume loops in this process.
    pub consumers: usize,
    /// Time in-flight tasks get to finish after shutdown is requested.
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumers: 1,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl WorkerConfig {
    /// [`shutdown_grace_ms`](Self::shutdown_grace_ms) as a duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Why a task was handed back to the queue.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// No admission slot was granted; the task never started.
    #[error("admission: {0}")]
    Admission(#[from] AdmissionError),

    /// The engine failed the batch.
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl TaskFailure for WorkerError {
    fn attempted(&self) -> bool {
        !matches!(self, WorkerError::Admission(_))
    }
}

/// Runs consume loops that admit each task through the shared gate and
/// hand it to the engine.
///
/// A task whose batch only partially succeeded is acked: the skipped items
/// are recorded in the engine's stats and will be picked up by the next
/// search that returns them. Only batch-level failures are retried.
#[derive(Clone)]
pub struct Worker {
    queue: WorkQueue,
    engine: Arc<IngestionEngine>,
    gate: AdmissionGate,
    config: WorkerConfig,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.queue)
            .field("gate", &self.gate)
            .field("config", &self.config)
            .finish()
    }
}

impl Worker {
    /// Worker over `queue`, admitting through `gate`.
    pub fn new(
        queue: WorkQueue,
        engine: Arc<IngestionEngine>,
        gate: AdmissionGate,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            engine,
            gate,
            config,
        }
    }

    /// Consume until `shutdown` fires or a consume loop stops on its own
    /// (broker closed or failed), then give in-flight tasks the configured
    /// grace period before aborting them.
    pub async fn run(
        &self,
        shutdown: CancellationToken,
    ) -> Result<ConsumeSummary, QueueError> {
        let loops = shutdown.child_token();
        let consumers = self.config.consumers.max(1);
        let mut set = JoinSet::new();

        for index in 0..consumers {
            let worker = self.clone();
            let cancel = loops.clone();
            set.spawn(async move { worker.consume_loop(index, cancel).await });
        }
        info!(queue = %self.queue.name(), consumers, "worker started");

        let mut total = ConsumeSummary::default();
        let mut first_error = None;

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(queue = %self.queue.name(), "shutdown requested; draining consumers");
            }
            joined = set.join_next() => {
                if let Some(joined) = joined {
                    collect(joined, &mut total, &mut first_error);
                }
                loops.cancel();
            }
        }

        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = set.join_next().await {
                collect(joined, &mut total, &mut first_error);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                queue = %self.queue.name(),
                grace = ?grace,
                "consumers did not finish within grace period; aborting"
            );
            set.abort_all();
            while set.join_next().await.is_some() {}
        }

        info!(
            queue = %self.queue.name(),
            acked = total.acked,
            requeued = total.requeued,
            released = total.released,
            dead_lettered = total.dead_lettered,
            poisoned = total.poisoned,
            "worker stopped"
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }

    async fn consume_loop(
        &self,
        index: usize,
        cancel: CancellationToken,
    ) -> Result<ConsumeSummary, QueueError> {
        let engine = Arc::clone(&self.engine);
        let gate = self.gate.clone();
        let handler_cancel = cancel.clone();

        let result = self
            .queue
            .consume(cancel, move |task| {
                let engine = Arc::clone(&engine);
                let gate = gate.clone();
                let cancel = handler_cancel.clone();
                async move { handle_task(&engine, &gate, &cancel, task).await }
            })
            .await;

        if let Err(err) = &result {
            error!(consumer = index, error = %err, "consume loop failed");
        }
        result
    }
}

/// Process one task under an admission slot.
///
/// A wait for the slot that ends without one is reported as
/// [`WorkerError::Admission`], which the queue hands back without charging
/// an attempt. An empty query ingests the newest upstream photos instead of searching.
pub async fn handle_task(
    engine: &IngestionEngine,
    gate: &AdmissionGate,
    cancel: &CancellationToken,
    task: SearchTask,
) -> Result<(), WorkerError> {
    let _slot = gate.acquire(cancel, None).await?;

    let report = if task.query.trim().is_empty() {
        engine.ingest_latest(task.page, task.per_page).await?
    } else {
        engine
            .search_and_persist_report(&task.query, task.page, task.per_page)
            .await?
    };

    if report.is_complete() {
        info!(
            query = %task.query,
            page = task.page,
            photos = report.photos.len(),
            ingested = report.ingested,
            "task completed"
        );
    } else {
        warn!(
            query = %task.query,
            page = task.page,
            photos = report.photos.len(),
            skipped = report.skipped.len(),
            "task completed with skipped photos"
        );
    }
    Ok(())
}

fn collect(
    joined: Result<Result<ConsumeSummary, QueueError>, JoinError>,
    total: &mut ConsumeSummary,
    first_error: &mut Option<QueueError>,
) {
    match joined {
        Ok(Ok(summary)) => total.absorb(summary),
        Ok(Err(err)) => {
            first_error.get_or_insert(err);
        }
        Err(err) if err.is_cancelled() => {}
        Err(err) => {
            error!(error = %err, "consume loop panicked");
            first_error
                .get_or_insert(QueueError::Internal(format!("consumer panicked: {err}")));
        }
    }
}
