//! Admission control for the inference backend.
//!
//! The backend can only run `max_active` requests at once. Each forwarded call
//! holds a [`SlotLease`] for its whole lifetime. Callers that find every slot
//! taken are either rejected straight away or parked in a bounded wait queue
//! until a slot frees up or their queue timeout expires.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use prometheus::IntGauge;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// What to do with a request when every slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueMode {
    /// Wait in the bounded queue for up to `queue_timeout`.
    #[default]
    Queue,
    /// Fail immediately with [`AdmissionError::Busy`].
    Reject,
}

impl FromStr for QueueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(QueueMode::Queue),
            "reject" => Ok(QueueMode::Reject),
            other => Err(format!("unknown queue mode '{}' (expected 'queue' or 'reject')", other)),
        }
    }
}

/// Configuration for the admission controller.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Number of slots, i.e. concurrent backend calls.
    pub max_active: usize,
    pub queue_mode: QueueMode,
    /// Maximum number of waiting callers.
    pub queue_max: usize,
    /// How long a queued caller waits for a slot.
    pub queue_timeout: Duration,
}

/// Reasons a request is not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("GPU busy")]
    Busy,

    #[error("Queue full")]
    QueueFull,

    #[error("Queue timeout")]
    QueueTimeout,

    #[error("Admission closed")]
    Closed,
}

impl AdmissionError {
    /// Seconds the caller should wait before retrying.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AdmissionError::Busy => Some(2),
            AdmissionError::QueueFull | AdmissionError::QueueTimeout => Some(5),
            AdmissionError::Closed => None,
        }
    }
}

/// How a successful admission was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Immediate,
    Queued { waited: Duration },
}

/// A held slot. Dropping the lease (or calling [`SlotLease::release`]) returns
/// the slot to the pool, so a lease is released exactly once.
#[derive(Debug)]
pub struct SlotLease {
    _permit: OwnedSemaphorePermit,
    admission: Admission,
    admitted_at: Instant,
}

impl SlotLease {
    fn new(permit: OwnedSemaphorePermit, admission: Admission) -> Self {
        Self {
            _permit: permit,
            admission,
            admitted_at: Instant::now(),
        }
    }

    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// When the admission decision succeeded.
    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// Give the slot back to the pool.
    pub fn release(self) {
        drop(self);
    }
}

/// One caller waiting for a slot, identified by its enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTicket {
    enqueued_at: Instant,
}

impl WaitTicket {
    fn now() -> Self {
        Self {
            enqueued_at: Instant::now(),
        }
    }
}

/// Remove the first ticket equal to `ticket`, keeping the others in order.
///
/// Tickets are compared by enqueue time only. Two tickets created within the
/// same clock tick are indistinguishable and the earlier-queued one is removed.
fn remove_first(queue: &mut VecDeque<WaitTicket>, ticket: WaitTicket) -> bool {
    match queue.iter().position(|t| *t == ticket) {
        Some(index) => {
            queue.remove(index);
            true
        }
        None => false,
    }
}

/// Bounded-concurrency gate plus bounded wait queue.
pub struct AdmissionController {
    config: AdmissionConfig,
    slots: Arc<Semaphore>,
    waiters: Mutex<VecDeque<WaitTicket>>,
    queue_depth: IntGauge,
}

impl AdmissionController {
    /// Create a controller. `queue_depth` is kept equal to the wait queue size.
    pub fn new(config: AdmissionConfig, queue_depth: IntGauge) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_active));
        queue_depth.set(0);
        Self {
            waiters: Mutex::new(VecDeque::with_capacity(config.queue_max.min(1024))),
            config,
            slots,
            queue_depth,
        }
    }

    /// Acquire a slot, waiting in the queue if the overload policy allows it.
    pub async fn acquire(&self) -> Result<SlotLease, AdmissionError> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => return Ok(SlotLease::new(permit, Admission::Immediate)),
            Err(TryAcquireError::Closed) => return Err(AdmissionError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        if self.config.queue_mode == QueueMode::Reject {
            tracing::debug!("All {} slots busy, rejecting", self.config.max_active);
            return Err(AdmissionError::Busy);
        }

        let ticket = self.enqueue()?;
        let waited_since = Instant::now();

        let result = tokio::time::timeout(
            self.config.queue_timeout,
            self.slots.clone().acquire_owned(),
        )
        .await;
        drop(ticket);

        match result {
            Ok(Ok(permit)) => {
                let waited = waited_since.elapsed();
                tracing::debug!(waited_ms = waited.as_millis() as u64, "Queued request admitted");
                Ok(SlotLease::new(permit, Admission::Queued { waited }))
            }
            Ok(Err(_)) => Err(AdmissionError::Closed),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.queue_timeout.as_millis() as u64,
                    "Request timed out waiting for a slot"
                );
                Err(AdmissionError::QueueTimeout)
            }
        }
    }

    /// Number of callers currently waiting.
    pub fn queue_depth(&self) -> usize {
        self.waiters().len()
    }

    /// Number of free slots.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Set the queue-depth gauge to the current wait queue size.
    pub fn refresh_queue_depth(&self) {
        let waiters = self.waiters();
        self.queue_depth.set(waiters.len() as i64);
    }

    fn enqueue(&self) -> Result<QueuedTicket<'_>, AdmissionError> {
        let mut waiters = self.waiters();
        if waiters.len() >= self.config.queue_max {
            tracing::debug!(queue_max = self.config.queue_max, "Wait queue full, rejecting");
            return Err(AdmissionError::QueueFull);
        }

        let ticket = WaitTicket::now();
        waiters.push_back(ticket);
        self.queue_depth.set(waiters.len() as i64);
        tracing::debug!(queue_depth = waiters.len(), "Request queued for a slot");

        Ok(QueuedTicket {
            controller: self,
            ticket,
        })
    }

    fn remove_ticket(&self, ticket: WaitTicket) {
        let mut waiters = self.waiters();
        if !remove_first(&mut waiters, ticket) {
            tracing::warn!("Wait ticket already removed from queue");
        }
        self.queue_depth.set(waiters.len() as i64);
    }

    fn waiters(&self) -> MutexGuard<'_, VecDeque<WaitTicket>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns a queued ticket; dropping it removes the ticket from the queue.
///
/// Covers the timeout and success paths as well as a caller that goes away
/// while still waiting.
struct QueuedTicket<'a> {
    controller: &'a AdmissionController,
    ticket: WaitTicket,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        self.controller.remove_ticket(self.ticket);
    }
}
