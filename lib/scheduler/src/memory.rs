//! In-process [`Broker`] for tests and single-process runs.

use crate::broker::{Broker, DUPLICATE_WINDOW, RecurringRegistration, RegisteredJob};
use crate::error::BrokerError;
use crate::job::{JobDisposition, JobHandler, SyncJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classync_core::ScheduleId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Default delivery attempts before a job is dead-lettered.
pub const DEFAULT_MAX_DELIVER: u32 = 5;

#[derive(Debug, Clone)]
struct Queued {
    job: SyncJob,
    attempt: u32,
}

/// A job that ran out of attempts or failed fatally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub job: SyncJob,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Queued>,
    in_flight: HashMap<ScheduleId, usize>,
    seen_dedup_ids: HashMap<String, Instant>,
    recurring: HashMap<String, RegisteredJob>,
    next_revision: u64,
    dead_letters: Vec<DeadLetter>,
}

/// A [`Broker`] keeping its queue and recurring table in memory.
///
/// Jobs are processed by calling [`MemoryBroker::drain`]. Retries are
/// redelivered immediately without backoff. Dedup ids are forgotten after
/// [`DUPLICATE_WINDOW`], as JetStream does.
pub struct MemoryBroker {
    state: Mutex<State>,
    max_deliver: u32,
    duplicate_window: Duration,
    unavailable: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_deliver(DEFAULT_MAX_DELIVER)
    }

    /// Creates an empty broker giving each job `max_deliver` attempts.
    #[must_use]
    pub fn with_max_deliver(max_deliver: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_deliver: max_deliver.max(1),
            duplicate_window: DUPLICATE_WINDOW,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Sets how long a dedup id keeps dropping jobs.
    #[must_use]
    pub fn with_duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }

    /// Makes every subsequent operation fail with [`BrokerError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Jobs waiting for delivery, oldest first.
    pub async fn pending_jobs(&self) -> Vec<SyncJob> {
        self.state
            .lock()
            .await
            .queue
            .iter()
            .map(|q| q.job.clone())
            .collect()
    }

    /// Jobs that were dropped.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Delivers queued jobs to `handler` until the queue is empty.
    ///
    /// Returns the number of deliveries made.
    pub async fn drain(&self, handler: &dyn JobHandler) -> usize {
        let mut deliveries = 0;
        while let Some(queued) = self.next_delivery().await {
            deliveries += 1;
            let disposition = handler.handle(&queued.job).await;
            self.settle(queued, disposition).await;
        }
        deliveries
    }

    async fn next_delivery(&self) -> Option<Queued> {
        let mut state = self.state.lock().await;
        let queued = state.queue.pop_front()?;
        *state.in_flight.entry(queued.job.schedule_id).or_default() += 1;
        Some(queued)
    }

    async fn settle(&self, queued: Queued, disposition: JobDisposition) {
        let mut state = self.state.lock().await;
        let schedule_id = queued.job.schedule_id;
        if let Some(count) = state.in_flight.get_mut(&schedule_id) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&schedule_id);
            }
        }

        match disposition {
            JobDisposition::Done => {}
            JobDisposition::Retry { reason } if queued.attempt < self.max_deliver => {
                warn!(%schedule_id, attempt = queued.attempt, %reason, "sync job will be retried");
                state.queue.push_back(Queued {
                    job: queued.job,
                    attempt: queued.attempt + 1,
                });
            }
            JobDisposition::Retry { reason } | JobDisposition::Fatal { reason } => {
                warn!(%schedule_id, attempts = queued.attempt, %reason, "sync job dead-lettered");
                state.dead_letters.push(DeadLetter {
                    job: queued.job,
                    attempts: queued.attempt,
                    reason,
                });
            }
        }
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job: SyncJob, dedup_id: Option<String>) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(id) = dedup_id {
            let now = Instant::now();
            let window = self.duplicate_window;
            state
                .seen_dedup_ids
                .retain(|_, seen| now.duration_since(*seen) < window);
            if state.seen_dedup_ids.contains_key(&id) {
                return Ok(());
            }
            state.seen_dedup_ids.insert(id, now);
        }
        state.queue.push_back(Queued { job, attempt: 1 });
        Ok(())
    }

    async fn add_repeatable(
        &self,
        registration: RecurringRegistration,
    ) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.next_revision += 1;
        let revision = state.next_revision;
        state.recurring.insert(
            registration.key.clone(),
            RegisteredJob {
                registration,
                revision,
            },
        );
        Ok(())
    }

    async fn remove_repeatable(&self, key: &str) -> Result<bool, BrokerError> {
        self.check_available()?;
        Ok(self.state.lock().await.recurring.remove(key).is_some())
    }

    async fn list_repeatable(&self) -> Result<Vec<RegisteredJob>, BrokerError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut jobs: Vec<RegisteredJob> = state.recurring.values().cloned().collect();
        jobs.sort_by(|a, b| a.registration.key.cmp(&b.registration.key));
        Ok(jobs)
    }

    async fn advance_repeatable(
        &self,
        key: &str,
        revision: u64,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.next_revision += 1;
        let new_revision = state.next_revision;
        match state.recurring.get_mut(key) {
            Some(entry) if entry.revision == revision => {
                entry.registration.next_run_at = next_run_at;
                entry.revision = new_revision;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_pending(&self, schedule_id: ScheduleId) -> Result<bool, BrokerError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.in_flight.contains_key(&schedule_id)
            || state.queue.iter().any(|q| q.job.schedule_id == schedule_id))
    }
}
