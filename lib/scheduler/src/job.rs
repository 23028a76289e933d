//! Sync jobs and the handler seam between the broker and the executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classync_core::ScheduleId;
use serde::{Deserialize, Serialize};

/// Deterministic key of a schedule's recurring registration.
#[must_use]
pub fn job_key(schedule_id: ScheduleId) -> String {
    format!("sync-{schedule_id}")
}

/// Why a job was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTrigger {
    /// Requested directly, outside the recurring schedule.
    Immediate,
    /// Fired by a recurring registration for the given slot.
    Recurring { slot: DateTime<Utc> },
}

/// A unit of work: synchronize one schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    /// The schedule to synchronize.
    pub schedule_id: ScheduleId,
    /// What enqueued the job.
    pub trigger: JobTrigger,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl SyncJob {
    /// A one-off job.
    #[must_use]
    pub fn immediate(schedule_id: ScheduleId) -> Self {
        Self {
            schedule_id,
            trigger: JobTrigger::Immediate,
            enqueued_at: Utc::now(),
        }
    }

    /// A job for one recurring slot.
    #[must_use]
    pub fn recurring(schedule_id: ScheduleId, slot: DateTime<Utc>) -> Self {
        Self {
            schedule_id,
            trigger: JobTrigger::Recurring { slot },
            enqueued_at: Utc::now(),
        }
    }

    /// Broker-level deduplication id, if the job has one.
    ///
    /// Recurring jobs are deduplicated per slot; immediate jobs never are.
    #[must_use]
    pub fn dedup_id(&self) -> Option<String> {
        match self.trigger {
            JobTrigger::Immediate => None,
            JobTrigger::Recurring { slot } => Some(format!(
                "{}@{}",
                job_key(self.schedule_id),
                slot.timestamp_millis()
            )),
        }
    }
}

/// What the broker should do with a delivered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    /// Acknowledge; the job is finished.
    Done,
    /// Redeliver later with backoff, until attempts run out.
    Retry { reason: String },
    /// Drop without redelivery.
    Fatal { reason: String },
}

/// Processes delivered jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handles one delivery of `job`.
    async fn handle(&self, job: &SyncJob) -> JobDisposition;
}
