use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use super::{
    DeadLetter, Delivery, DeliveryTag, QueueBroker, QueueConfig,
    QueueSnapshot, RejectOutcome,
};
use crate::error::QueueError;

#[derive(Debug)]
struct Message {
    id: Uuid,
    body: Vec<u8>,
    /// Failed deliveries so far.
    attempts: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    leased: HashMap<DeliveryTag, Message>,
    completed: u64,
    dead: Vec<DeadLetter>,
}

/// Process-local broker for development and tests.
///
/// Same delivery semantics as the Postgres broker except that leases never
/// expire: a delivery is held until it is acked or rejected.
#[derive(Debug)]
pub struct InMemoryQueueBroker {
    config: QueueConfig,
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
}

impl Default for InMemoryQueueBroker {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl InMemoryQueueBroker {
    /// Empty broker.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Stop delivering. Pending and future `receive` calls return `None`
    /// and publishes fail with [`QueueError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dead_letter(state: &mut State, message: Message, reason: Option<String>) {
        state.dead.push(DeadLetter {
            id: message.id,
            payload: String::from_utf8_lossy(&message.body).into_owned(),
            attempts: message.attempts,
            last_error: reason,
            dead_lettered_at: Utc::now(),
        });
    }
}

#[async_trait]
impl QueueBroker for InMemoryQueueBroker {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.state().ready.push_back(Message {
            id: Uuid::now_v7(),
            body,
            attempts: 0,
            enqueued_at: Utc::now(),
        });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        loop {
            // Register interest before checking so a publish in between is
            // not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Ok(None);
            }

            {
                let mut state = self.state();
                if let Some(message) = state.ready.pop_front() {
                    let delivery = Delivery {
                        tag: DeliveryTag::new(),
                        body: message.body.clone(),
                        attempt: message.attempts + 1,
                        enqueued_at: message.enqueued_at,
                    };
                    state.leased.insert(delivery.tag, message);
                    return Ok(Some(delivery));
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let mut state = self.state();
        match state.leased.remove(&tag) {
            Some(_) => {
                state.completed += 1;
                Ok(())
            }
            None => Err(QueueError::Internal(format!(
                "unknown delivery tag {tag}"
            ))),
        }
    }

    async fn release(&self, tag: DeliveryTag) -> Result<bool, QueueError> {
        let mut state = self.state();
        let Some(message) = state.leased.remove(&tag) else {
            return Ok(false);
        };
        state.ready.push_front(message);
        drop(state);
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn reject(
        &self,
        tag: DeliveryTag,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<RejectOutcome, QueueError> {
        let mut state = self.state();
        let Some(mut message) = state.leased.remove(&tag) else {
            return Ok(RejectOutcome::LeaseLost);
        };

        message.attempts += 1;
        let attempts = message.attempts;
        if requeue && attempts < self.config.max_attempts {
            debug!(queue = %self.config.name, attempts, "message requeued");
            state.ready.push_back(message);
            drop(state);
            self.notify.notify_waiters();
            Ok(RejectOutcome::Requeued { attempts })
        } else {
            Self::dead_letter(&mut state, message, reason);
            Ok(RejectOutcome::DeadLettered { attempts })
        }
    }

    async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let state = self.state();
        Ok(QueueSnapshot {
            queue: self.config.name.clone(),
            ready: state.ready.len() as u64,
            leased: state.leased.len() as u64,
            completed: state.completed,
            dead_letter: state.dead.len() as u64,
            captured_at: Utc::now(),
        })
    }

    async fn dead_letters(
        &self,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self
            .state()
            .dead
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
