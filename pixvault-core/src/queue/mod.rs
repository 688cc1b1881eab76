//! Durable work queue carrying [`SearchTask`]s between producers and workers.
//!
//! [`WorkQueue`] owns the delivery protocol (serialization, publish timeout,
//! ack/reject decisions); a [`QueueBroker`] owns storage and redelivery.
//! Delivery is at-least-once: a task is removed only after an ack, and a
//! handler failure puts it back until it has used up its attempts.

/// Process-local broker.
pub mod memory;
/// Durable broker on Postgres.
pub mod postgres;

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{domain::SearchTask, error::QueueError};

pub use memory::InMemoryQueueBroker;
pub use postgres::PostgresQueueBroker;

/// Queue name shared by producers and consumers.
pub const DEFAULT_QUEUE_NAME: &str = "photo_search_queue";
/// Upper bound on a single publish.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
/// Extra time the client side waits past the publish timeout. Brokers
/// enforce the timeout themselves; this only catches a broker that hangs.
pub const PUBLISH_BACKSTOP: Duration = Duration::from_millis(500);

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_LEASE_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Tunables shared by every broker implementation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue shared by producers and consumers.
    pub name: String,
    /// Deliveries allowed before a task is dead-lettered.
    pub max_attempts: u32,
    /// How long a consumer may hold a delivery before it is reclaimed.
    pub lease_ttl_ms: u64,
    /// Idle sleep between empty polls.
    pub poll_interval_ms: u64,
    /// Upper bound on a publish, enforced by the broker.
    pub publish_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            publish_timeout_ms: PUBLISH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl QueueConfig {
    /// [`QueueConfig::lease_ttl_ms`] as a duration.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// [`QueueConfig::poll_interval_ms`] as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// [`QueueConfig::publish_timeout_ms`] as a duration.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Identifies one delivery of a message; stale after ack or reject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub Uuid);

impl DeliveryTag {
    /// Fresh tag.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for DeliveryTag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Handle for ack, release and reject.
    pub tag: DeliveryTag,
    /// Encoded task.
    pub body: Vec<u8>,
    /// 1 on first delivery.
    pub attempt: u32,
    /// When the message was first published.
    pub enqueued_at: DateTime<Utc>,
}

/// What the broker did with a rejected delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Delivered again later.
    Requeued {
        /// Failed deliveries so far.
        attempts: u32,
    },
    /// Moved to the dead-letter set.
    DeadLettered {
        /// Failed deliveries in total.
        attempts: u32,
    },
    /// The delivery was no longer held (acked, rejected or reclaimed).
    LeaseLost,
}

/// Message counts by state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Queue name.
    pub queue: String,
    /// Waiting for a consumer.
    pub ready: u64,
    /// Held by a consumer.
    pub leased: u64,
    /// Acked.
    pub completed: u64,
    /// Given up on.
    pub dead_letter: u64,
    /// When the counts were read.
    pub captured_at: DateTime<Utc>,
}

/// A message that will not be delivered again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Message id.
    pub id: Uuid,
    /// Message body, lossily decoded for display.
    pub payload: String,
    /// Failed deliveries.
    pub attempts: u32,
    /// Reason recorded by the last rejection.
    pub last_error: Option<String>,
    /// When it was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Storage and redelivery for one named queue.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Queue name.
    fn name(&self) -> &str;

    /// Append a message to the queue.
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError>;

    /// Wait for the next delivery. `Ok(None)` means the broker is closed and
    /// no further deliveries will arrive.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Mark a delivery done.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Put a delivery back without charging an attempt, for work that was
    /// never started. Returns `false` when the delivery was no longer held.
    async fn release(&self, tag: DeliveryTag) -> Result<bool, QueueError>;

    /// Release a delivery. With `requeue` the message is delivered again
    /// unless it has reached its attempt ceiling; without it the message is
    /// dead-lettered immediately.
    async fn reject(
        &self,
        tag: DeliveryTag,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<RejectOutcome, QueueError>;

    /// Current counts by state.
    async fn snapshot(&self) -> Result<QueueSnapshot, QueueError>;

    /// Most recent dead letters first.
    async fn dead_letters(
        &self,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, QueueError>;
}

/// Counts for one consume loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeSummary {
    /// Handler successes.
    pub acked: u64,
    /// Failures put back for another attempt.
    pub requeued: u64,
    /// Messages dead-lettered.
    pub dead_lettered: u64,
    /// Messages that could not be decoded.
    pub poisoned: u64,
    /// Deliveries handed back untouched, without using an attempt.
    pub released: u64,
}

impl ConsumeSummary {
    /// Add another loop's counts to this one.
    pub fn absorb(&mut self, other: ConsumeSummary) {
        self.acked += other.acked;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
        self.poisoned += other.poisoned;
        self.released += other.released;
    }

    fn record_reject(&mut self, outcome: RejectOutcome) {
        match outcome {
            RejectOutcome::Requeued { .. } => self.requeued += 1,
            RejectOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            RejectOutcome::LeaseLost => {}
        }
    }
}

/// Handler failure as seen by [`WorkQueue::consume`].
pub trait TaskFailure: fmt::Display {
    /// `false` when the handler gave up before working on the task, e.g. it
    /// was cancelled while waiting for capacity. Such a delivery goes back to
    /// the queue without using up an attempt.
    fn attempted(&self) -> bool {
        true
    }
}

impl TaskFailure for String {}

impl TaskFailure for &str {}

/// Producer and consumer front of a [`QueueBroker`].
#[derive(Clone)]
pub struct WorkQueue {
    broker: Arc<dyn QueueBroker>,
    publish_timeout: Duration,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("queue", &self.broker.name())
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

impl WorkQueue {
    /// Front `broker` with the default publish timeout.
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self {
            broker,
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }

    /// Should match the broker's own publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// The underlying broker.
    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    /// Name of the underlying queue.
    pub fn name(&self) -> &str {
        self.broker.name()
    }

    /// Serialize and enqueue `task`, failing with
    /// [`QueueError::PublishTimeout`] when the broker does not confirm in
    /// time.
    ///
    /// The broker bounds its own write, so a publish it reports as timed out
    /// was not enqueued. The local deadline sits [`PUBLISH_BACKSTOP`] later
    /// and only fires for a broker that stops responding.
    pub async fn publish(&self, task: &SearchTask) -> Result<(), QueueError> {
        let body = task.to_json()?;
        let deadline = self.publish_timeout + PUBLISH_BACKSTOP;
        match tokio::time::timeout(deadline, self.broker.publish(body)).await
        {
            Ok(Ok(())) => {
                debug!(
                    queue = self.broker.name(),
                    query = %task.query,
                    page = task.page,
                    per_page = task.per_page,
                    "task published"
                );
                Ok(())
            }
            Ok(Err(err)) => {
                error!(queue = self.broker.name(), error = %err, "publish failed");
                Err(err)
            }
            Err(_) => {
                error!(
                    queue = self.broker.name(),
                    timeout = ?self.publish_timeout,
                    "publish timed out"
                );
                Err(QueueError::PublishTimeout(self.publish_timeout))
            }
        }
    }

    /// Deliver tasks to `handler` one at a time until `cancel` fires or the
    /// broker closes.
    ///
    /// Malformed messages are dead-lettered without reaching the handler. A
    /// handler success acks; a handler error rejects with requeue, unless
    /// [`TaskFailure::attempted`] says no work was done, in which case the
    /// delivery is released without using an attempt. Ack and
    /// reject failures are logged and the loop carries on, since the broker
    /// will redeliver an unacknowledged message. Cancellation is observed
    /// between deliveries: a handler that has started runs to completion.
    pub async fn consume<F, Fut, E>(
        &self,
        cancel: CancellationToken,
        handler: F,
    ) -> Result<ConsumeSummary, QueueError>
    where
        F: Fn(SearchTask) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), E>> + Send,
        E: TaskFailure + Send,
    {
        let queue = self.broker.name().to_string();
        let mut summary = ConsumeSummary::default();
        info!(queue = %queue, "consumer started");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(queue = %queue, "consumer cancelled");
                    break;
                }
                received = self.broker.receive() => match received? {
                    Some(delivery) => delivery,
                    None => {
                        info!(queue = %queue, "queue closed; consumer stopping");
                        break;
                    }
                },
            };

            let task = match SearchTask::from_json(&delivery.body) {
                Ok(task) => task,
                Err(err) => {
                    warn!(
                        queue = %queue,
                        tag = %delivery.tag,
                        error = %err,
                        "discarding malformed message"
                    );
                    summary.poisoned += 1;
                    match self
                        .broker
                        .reject(
                            delivery.tag,
                            false,
                            Some(format!("malformed message: {err}")),
                        )
                        .await
                    {
                        Ok(outcome) => summary.record_reject(outcome),
                        Err(err) => {
                            error!(queue = %queue, error = %err, "reject failed")
                        }
                    }
                    continue;
                }
            };

            debug!(
                queue = %queue,
                tag = %delivery.tag,
                attempt = delivery.attempt,
                query = %task.query,
                "processing task"
            );

            match handler(task).await {
                Ok(()) => match self.broker.ack(delivery.tag).await {
                    Ok(()) => summary.acked += 1,
                    Err(err) => {
                        error!(queue = %queue, tag = %delivery.tag, error = %err, "ack failed")
                    }
                },
                Err(err) if !err.attempted() => {
                    info!(
                        queue = %queue,
                        tag = %delivery.tag,
                        reason = %err,
                        "task not started; releasing"
                    );
                    match self.broker.release(delivery.tag).await {
                        Ok(true) => summary.released += 1,
                        Ok(false) => {
                            warn!(queue = %queue, tag = %delivery.tag, "release for lost lease")
                        }
                        Err(err) => {
                            error!(queue = %queue, tag = %delivery.tag, error = %err, "release failed")
                        }
                    }
                }
                Err(err) => {
                    let reason = err.to_string();
                    warn!(
                        queue = %queue,
                        tag = %delivery.tag,
                        attempt = delivery.attempt,
                        error = %reason,
                        "task failed; requeueing"
                    );
                    match self
                        .broker
                        .reject(delivery.tag, true, Some(reason))
                        .await
                    {
                        Ok(outcome) => {
                            if let RejectOutcome::DeadLettered { attempts } =
                                outcome
                            {
                                warn!(
                                    queue = %queue,
                                    tag = %delivery.tag,
                                    attempts,
                                    "task dead-lettered after repeated failures"
                                );
                            }
                            summary.record_reject(outcome);
                        }
                        Err(err) => {
                            error!(queue = %queue, tag = %delivery.tag, error = %err, "reject failed")
                        }
                    }
                }
            }
        }

        info!(
            queue = %queue,
            acked = summary.acked,
            requeued = summary.requeued,
            dead_lettered = summary.dead_lettered,
            poisoned = summary.poisoned,
            released = summary.released,
            "consumer stopped"
        );
        Ok(summary)
    }
}
