//! The job scheduler used by the rest of the engine.

use crate::broker::{Broker, RecurringRegistration};
use crate::error::{BrokerError, SchedulerError};
use crate::job::{SyncJob, job_key};
use chrono::Utc;
use classync_core::ScheduleId;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a scheduler operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The broker applied the operation.
    Applied,
    /// The scheduler is disabled and did nothing.
    Skipped,
}

impl Dispatch {
    /// Returns whether the operation reached the broker.
    #[must_use]
    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }
}

/// Maintains at most one recurring job per schedule and enqueues one-off runs.
///
/// A scheduler built without a reachable broker is [`JobScheduler::Disabled`]:
/// every operation logs a warning and returns [`Dispatch::Skipped`] so that
/// the rest of the system keeps working without background sync.
#[derive(Clone)]
pub enum JobScheduler {
    /// Backed by a live broker.
    Active(Arc<dyn Broker>),
    /// No broker; all operations are no-ops.
    Disabled,
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active(_) => f.write_str("JobScheduler::Active"),
            Self::Disabled => f.write_str("JobScheduler::Disabled"),
        }
    }
}

impl JobScheduler {
    /// A scheduler backed by `broker`.
    #[must_use]
    pub fn active(broker: Arc<dyn Broker>) -> Self {
        Self::Active(broker)
    }

    /// Returns whether background sync is available.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Returns the broker, if any.
    #[must_use]
    pub fn broker(&self) -> Option<&Arc<dyn Broker>> {
        match self {
            Self::Active(broker) => Some(broker),
            Self::Disabled => None,
        }
    }

    fn active_broker(
        &self,
        operation: &'static str,
        schedule_id: ScheduleId,
    ) -> Option<&Arc<dyn Broker>> {
        let broker = self.broker();
        if broker.is_none() {
            warn!(%schedule_id, operation, "scheduler disabled, skipping");
        }
        broker
    }

    /// Replaces the schedule's recurring job with one firing every
    /// `interval_minutes`.
    ///
    /// Safe to call repeatedly; there is never more than one registration
    /// under `sync-<schedule id>`. The interval is validated by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails.
    pub async fn schedule_recurring(
        &self,
        schedule_id: ScheduleId,
        interval_minutes: u32,
    ) -> Result<Dispatch, SchedulerError> {
        const OPERATION: &str = "schedule_recurring";
        let Some(broker) = self.active_broker(OPERATION, schedule_id) else {
            return Ok(Dispatch::Skipped);
        };
        let wrap = |source| SchedulerError::Broker {
            operation: OPERATION,
            schedule_id,
            source,
        };

        let key = job_key(schedule_id);
        let replaced = broker.remove_repeatable(&key).await.map_err(wrap)?;
        broker
            .add_repeatable(RecurringRegistration::every_minutes(
                schedule_id,
                interval_minutes,
                Utc::now(),
            ))
            .await
            .map_err(wrap)?;

        debug!(%schedule_id, interval_minutes, replaced, "recurring sync scheduled");
        Ok(Dispatch::Applied)
    }

    /// Enqueues a one-off sync independent of the recurring schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails.
    pub async fn trigger_immediate(
        &self,
        schedule_id: ScheduleId,
    ) -> Result<Dispatch, SchedulerError> {
        const OPERATION: &str = "trigger_immediate";
        let Some(broker) = self.active_broker(OPERATION, schedule_id) else {
            return Ok(Dispatch::Skipped);
        };

        broker
            .enqueue(SyncJob::immediate(schedule_id), None)
            .await
            .map_err(|source| SchedulerError::Broker {
                operation: OPERATION,
                schedule_id,
                source,
            })?;

        debug!(%schedule_id, "immediate sync enqueued");
        Ok(Dispatch::Applied)
    }

    /// Removes the schedule's recurring job. In-flight runs are not
    /// interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails.
    pub async fn cancel_recurring(
        &self,
        schedule_id: ScheduleId,
    ) -> Result<Dispatch, SchedulerError> {
        const OPERATION: &str = "cancel_recurring";
        let Some(broker) = self.active_broker(OPERATION, schedule_id) else {
            return Ok(Dispatch::Skipped);
        };

        let removed = broker
            .remove_repeatable(&job_key(schedule_id))
            .await
            .map_err(|source| SchedulerError::Broker {
                operation: OPERATION,
                schedule_id,
                source,
            })?;

        debug!(%schedule_id, removed, "recurring sync cancelled");
        Ok(Dispatch::Applied)
    }

    /// Returns whether a job for the schedule is waiting or running.
    ///
    /// Always `false` when disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails.
    pub async fn is_syncing(&self, schedule_id: ScheduleId) -> Result<bool, SchedulerError> {
        match self {
            Self::Disabled => Ok(false),
            Self::Active(broker) => {
                broker
                    .is_pending(schedule_id)
                    .await
                    .map_err(|source: BrokerError| SchedulerError::Broker {
                        operation: "is_syncing",
                        schedule_id,
                        source,
                    })
            }
        }
    }
}
