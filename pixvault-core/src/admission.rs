//! Admission control bounding concurrent ingestion work.
//!
//! One [`AdmissionGate`] is created per process and handed to every entry
//! point (HTTP handlers and queue consumers), so the bound holds across all
//! of them.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AdmissionError;

/// Default number of concurrent admissions.
pub const DEFAULT_ADMISSION_CAPACITY: usize = 5;

#[derive(Debug, Default)]
struct GateCounters {
    granted: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

/// Counting gate with at most `capacity` holders at a time.
///
/// Cloning shares the underlying slots.
#[derive(Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<GateCounters>,
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(DEFAULT_ADMISSION_CAPACITY)
    }
}

/// A held admission slot. Dropping it releases the slot, so release happens
/// exactly once on every exit path including panics.
#[must_use = "the slot is released as soon as it is dropped"]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
    acquired_at: DateTime<Utc>,
}

impl AdmissionSlot {
    /// When the slot was granted.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

impl fmt::Debug for AdmissionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

/// Point-in-time view of a gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSnapshot {
    /// Total slots.
    pub capacity: usize,
    /// Slots currently held.
    pub in_flight: usize,
    /// Acquisitions granted since start.
    pub granted: u64,
    /// Waits that hit their deadline.
    pub timed_out: u64,
    /// Waits cancelled by the caller.
    pub cancelled: u64,
}

impl AdmissionGate {
    /// A gate with `capacity` slots; zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(GateCounters::default()),
        }
    }

    /// Configured slot count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Some(self.grant(permit)),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Wait for a slot.
    ///
    /// With `max_wait` the wait is bounded and ends in
    /// [`AdmissionError::TimedOut`]; without it the caller waits until a slot
    /// frees up. `cancel` aborts the wait at any point. When the wait gives
    /// up no slot is held.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        max_wait: Option<Duration>,
    ) -> Result<AdmissionSlot, AdmissionError> {
        if cancel.is_cancelled() {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(AdmissionError::Cancelled);
        }

        if let Some(slot) = self.try_acquire() {
            return Ok(slot);
        }

        let permits = Arc::clone(&self.permits);
        let wait = async move {
            match max_wait {
                Some(limit) => {
                    match tokio::time::timeout(limit, permits.acquire_owned())
                        .await
                    {
                        Ok(Ok(permit)) => Ok(permit),
                        Ok(Err(_)) => Err(AdmissionError::Closed),
                        Err(_) => Err(AdmissionError::TimedOut(limit)),
                    }
                }
                None => permits
                    .acquire_owned()
                    .await
                    .map_err(|_| AdmissionError::Closed),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AdmissionError::Cancelled),
            acquired = wait => acquired,
        };

        match outcome {
            Ok(permit) => Ok(self.grant(permit)),
            Err(err) => {
                match err {
                    AdmissionError::TimedOut(_) => {
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    }
                    AdmissionError::Cancelled => {
                        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    }
                    AdmissionError::Closed => {}
                }
                debug!(
                    capacity = self.capacity,
                    in_flight = self.in_flight(),
                    error = %err,
                    "admission refused"
                );
                Err(err)
            }
        }
    }

    /// Current counters.
    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            capacity: self.capacity,
            in_flight: self.in_flight(),
            granted: self.counters.granted.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> AdmissionSlot {
        self.counters.granted.fetch_add(1, Ordering::Relaxed);
        AdmissionSlot {
            _permit: permit,
            acquired_at: Utc::now(),
        }
    }
}
