//! Schedule management for the API layer.
//!
//! [`TimetableService`] owns the rules around creating, changing and removing
//! schedules and keeps their recurring jobs in step with storage.

use crate::error::ServiceError;
use chrono::{DateTime, Utc};
use classync_core::{ScheduleId, UserId};
use classync_integration::{CredentialVault, Provider, ProviderRegistry, RawCredentials};
use classync_scheduler::{Dispatch, JobScheduler};
use classync_store::{MIN_SYNC_INTERVAL_MINUTES, ScheduleEntity, TimetableStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Input for [`TimetableService::register_schedule`].
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub user_id: UserId,
    pub provider_id: String,
    pub organization_id: Option<String>,
    pub sync_interval_minutes: u32,
    pub credentials: RawCredentials,
}

/// Sync state of a schedule as shown to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub last_synced_at: Option<DateTime<Utc>>,
    /// A first sync has not completed yet, or a job is queued or running.
    pub syncing: bool,
}

/// Facade over storage, the vault and the scheduler.
#[derive(Clone)]
pub struct TimetableService {
    store: Arc<dyn TimetableStore>,
    vault: CredentialVault,
    registry: ProviderRegistry,
    scheduler: JobScheduler,
}

impl TimetableService {
    #[must_use]
    pub fn new(
        store: Arc<dyn TimetableStore>,
        vault: CredentialVault,
        registry: ProviderRegistry,
        scheduler: JobScheduler,
    ) -> Self {
        Self {
            store,
            vault,
            registry,
            scheduler,
        }
    }

    /// Registers a schedule, then queues its first sync and its recurring job.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::IntervalTooShort`] below the minimum interval
    /// - [`ServiceError::UnknownProvider`] for an unregistered provider
    /// - [`ServiceError::InvalidCredentials`] when the provider rejects them
    /// - [`ServiceError::AlreadyExists`] when the user already has a schedule
    ///   for this provider and organization
    pub async fn register_schedule(
        &self,
        new: NewSchedule,
    ) -> Result<ScheduleEntity, ServiceError> {
        validate_interval(new.sync_interval_minutes)?;
        let provider = self.registry.resolve(&new.provider_id)?;
        check_credentials(provider.as_ref(), &new.credentials).await?;

        let schedule = ScheduleEntity::new(
            new.user_id,
            new.provider_id,
            new.organization_id,
            new.sync_interval_minutes,
        );
        let record = self.vault.seal(&new.credentials)?.into_record(schedule.id);
        self.store.create_schedule(&schedule, &record).await?;
        info!(
            schedule_id = %schedule.id,
            provider_id = %schedule.provider_id,
            interval = schedule.sync_interval_minutes,
            "schedule registered"
        );

        let dispatch = self.scheduler.trigger_immediate(schedule.id).await?;
        note_skipped(dispatch, schedule.id, "first sync");
        let dispatch = self
            .scheduler
            .schedule_recurring(schedule.id, schedule.sync_interval_minutes)
            .await?;
        note_skipped(dispatch, schedule.id, "recurring sync");

        Ok(schedule)
    }

    /// Gets a schedule.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if it does not exist.
    pub async fn get_schedule(&self, id: ScheduleId) -> Result<ScheduleEntity, ServiceError> {
        self.store
            .find_schedule(id)
            .await?
            .ok_or(ServiceError::NotFound { id })
    }

    /// Lists a user's schedules, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn list_schedules(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ScheduleEntity>, ServiceError> {
        Ok(self.store.list_schedules_for_user(user_id).await?)
    }

    /// Changes how often a schedule syncs.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::IntervalTooShort`] or [`ServiceError::NotFound`],
    /// or an error if storage or the scheduler fails.
    pub async fn update_interval(
        &self,
        id: ScheduleId,
        minutes: u32,
    ) -> Result<(), ServiceError> {
        validate_interval(minutes)?;
        self.store.update_interval(id, minutes).await?;
        let dispatch = self.scheduler.schedule_recurring(id, minutes).await?;
        note_skipped(dispatch, id, "recurring sync");
        Ok(())
    }

    /// Replaces a schedule's credentials and syncs with them right away.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`], [`ServiceError::UnknownProvider`] or
    /// [`ServiceError::InvalidCredentials`], or an error if a dependency fails.
    pub async fn update_credentials(
        &self,
        id: ScheduleId,
        credentials: RawCredentials,
    ) -> Result<(), ServiceError> {
        let schedule = self.get_schedule(id).await?;
        let provider = self.registry.resolve(&schedule.provider_id)?;
        check_credentials(provider.as_ref(), &credentials).await?;

        let record = self.vault.seal(&credentials)?.into_record(id);
        self.store.replace_credential(&record).await?;
        info!(schedule_id = %id, "credentials replaced");

        let dispatch = self.scheduler.trigger_immediate(id).await?;
        note_skipped(dispatch, id, "sync");
        Ok(())
    }

    /// Queues a one-off sync of an existing schedule.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`], or an error if the scheduler fails.
    pub async fn trigger_sync(&self, id: ScheduleId) -> Result<Dispatch, ServiceError> {
        self.get_schedule(id).await?;
        let dispatch = self.scheduler.trigger_immediate(id).await?;
        note_skipped(dispatch, id, "sync");
        Ok(dispatch)
    }

    /// Deletes a schedule with its credentials and events, and stops its
    /// recurring job.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if the schedule did not exist.
    pub async fn delete_schedule(&self, id: ScheduleId) -> Result<(), ServiceError> {
        let existed = self.store.delete_schedule(id).await?;
        // A registration can outlive its schedule, so always cancel.
        let dispatch = self.scheduler.cancel_recurring(id).await?;
        note_skipped(dispatch, id, "recurring sync cancellation");

        if !existed {
            return Err(ServiceError::NotFound { id });
        }
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    /// Reports whether a schedule is being synced.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`], or an error if the scheduler fails.
    pub async fn sync_status(&self, id: ScheduleId) -> Result<SyncStatus, ServiceError> {
        let schedule = self.get_schedule(id).await?;
        let syncing = match schedule.last_synced_at {
            None => true,
            Some(_) => self.scheduler.is_syncing(id).await?,
        };
        Ok(SyncStatus {
            last_synced_at: schedule.last_synced_at,
            syncing,
        })
    }

    /// Re-registers the recurring job of every stored schedule.
    ///
    /// Returns the number of registrations the broker accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or the scheduler fails.
    pub async fn resubscribe_all(&self) -> Result<usize, ServiceError> {
        let schedules = self.store.list_schedules().await?;
        let mut applied = 0;
        for schedule in &schedules {
            let dispatch = self
                .scheduler
                .schedule_recurring(schedule.id, schedule.sync_interval_minutes)
                .await?;
            if dispatch.is_applied() {
                applied += 1;
            }
        }
        info!(schedules = schedules.len(), applied, "recurring syncs resubscribed");
        Ok(applied)
    }
}

fn validate_interval(minutes: u32) -> Result<(), ServiceError> {
    if minutes < MIN_SYNC_INTERVAL_MINUTES {
        return Err(ServiceError::IntervalTooShort {
            minutes,
            minimum: MIN_SYNC_INTERVAL_MINUTES,
        });
    }
    Ok(())
}

async fn check_credentials(
    provider: &dyn Provider,
    credentials: &RawCredentials,
) -> Result<(), ServiceError> {
    let accepted = provider
        .validate_credentials(credentials)
        .await
        .map_err(|source| ServiceError::Provider { source })?;
    if !accepted {
        return Err(ServiceError::InvalidCredentials {
            provider_id: provider.id(),
        });
    }
    Ok(())
}

fn note_skipped(dispatch: Dispatch, schedule_id: ScheduleId, what: &str) {
    if dispatch == Dispatch::Skipped {
        warn!(%schedule_id, "{what} not queued, background sync is disabled");
    }
}
