//! The broker seam: a durable job queue plus a recurring job table.

use crate::error::BrokerError;
use crate::job::{SyncJob, job_key};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use classync_core::ScheduleId;
use serde::{Deserialize, Serialize};

/// How long a broker remembers a dedup id and drops jobs carrying it.
pub const DUPLICATE_WINDOW: std::time::Duration = std::time::Duration::from_secs(120);

/// A recurring job in the broker's table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRegistration {
    /// `sync-<schedule id>`.
    pub key: String,
    /// The schedule the job synchronizes.
    pub schedule_id: ScheduleId,
    /// Repeat interval in milliseconds.
    pub interval_ms: u64,
    /// Start of the next slot to enqueue.
    pub next_run_at: DateTime<Utc>,
}

impl RecurringRegistration {
    /// A registration whose first slot is one interval after `now`.
    #[must_use]
    pub fn every_minutes(schedule_id: ScheduleId, minutes: u32, now: DateTime<Utc>) -> Self {
        let interval_ms = u64::from(minutes) * 60_000;
        Self {
            key: job_key(schedule_id),
            schedule_id,
            interval_ms,
            next_run_at: now + interval(interval_ms),
        }
    }

    /// Repeat interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        interval(self.interval_ms)
    }

    /// Returns whether the next slot has started.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }

    /// First slot strictly after `now`.
    ///
    /// Slots missed while no ticker ran are skipped rather than replayed.
    #[must_use]
    pub fn next_slot_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.next_run_at > now {
            return self.next_run_at;
        }
        let step = self.interval().num_milliseconds().max(1);
        let behind = (now - self.next_run_at).num_milliseconds();
        let steps = behind / step + 1;
        self.next_run_at + Duration::milliseconds(steps.saturating_mul(step))
    }
}

fn interval(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// A registration together with its table revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredJob {
    pub registration: RecurringRegistration,
    /// Opaque version used for compare-and-swap updates.
    pub revision: u64,
}

/// A durable job queue with a recurring job table.
///
/// Implementations make each method atomic on its own. Callers never do
/// read-modify-write on the table except through
/// [`Broker::advance_repeatable`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueues a job. Jobs sharing a `dedup_id` within the broker's
    /// deduplication window are enqueued once.
    async fn enqueue(&self, job: SyncJob, dedup_id: Option<String>) -> Result<(), BrokerError>;

    /// Stores a registration under its key.
    async fn add_repeatable(&self, registration: RecurringRegistration)
    -> Result<(), BrokerError>;

    /// Removes the registration under `key`. Returns whether one existed.
    async fn remove_repeatable(&self, key: &str) -> Result<bool, BrokerError>;

    /// Lists all registrations.
    async fn list_repeatable(&self) -> Result<Vec<RegisteredJob>, BrokerError>;

    /// Moves a registration's next slot, if it is still at `revision`.
    ///
    /// Returns `false` when the registration changed or disappeared since it
    /// was listed.
    async fn advance_repeatable(
        &self,
        key: &str,
        revision: u64,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, BrokerError>;

    /// Returns whether a job for the schedule is waiting or being processed.
    async fn is_pending(&self, schedule_id: ScheduleId) -> Result<bool, BrokerError>;
}
