//! The sync run state machine.
//!
//! A run walks `Resolved → CredentialsDecrypted → ProviderFetching →
//! Reconciling → Completed`. Any step may end it in `Aborted`. Reconciliation
//! replaces the schedule's events from the window start onwards with the
//! provider's answer, under the schedule's sync lock.

use crate::error::SyncError;
use crate::window::FetchWindow;
use chrono::{DateTime, Utc};
use classync_core::ScheduleId;
use classync_integration::{CredentialVault, ProviderError, ProviderRegistry, RawCredentials};
use classync_scheduler::{JobScheduler, SyncLock};
use classync_store::{
    CredentialRecord, Event, FetchedEvent, ScheduleEntity, StoreError, TimetableStore,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Provider calls taking longer than this are abandoned.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Resolved,
    CredentialsDecrypted,
    ProviderFetching,
    Reconciling,
    Completed,
    Aborted,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolved => "resolved",
            Self::CredentialsDecrypted => "credentials_decrypted",
            Self::ProviderFetching => "provider_fetching",
            Self::Reconciling => "reconciling",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A run that ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Events were replaced. Zero courses is a valid result.
    Completed {
        courses_count: u64,
        window: FetchWindow,
    },
    /// The schedule or its credentials are gone; its recurring job was
    /// cancelled.
    EntityNotFound,
}

/// Runs syncs for single schedules.
#[derive(Clone)]
pub struct SyncExecutor {
    store: Arc<dyn TimetableStore>,
    vault: CredentialVault,
    registry: ProviderRegistry,
    scheduler: JobScheduler,
    lock: Arc<dyn SyncLock>,
    fetch_timeout: Duration,
}

impl SyncExecutor {
    #[must_use]
    pub fn new(
        store: Arc<dyn TimetableStore>,
        vault: CredentialVault,
        registry: ProviderRegistry,
        scheduler: JobScheduler,
        lock: Arc<dyn SyncLock>,
    ) -> Self {
        Self {
            store,
            vault,
            registry,
            scheduler,
            lock,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Sets the bound on provider calls.
    #[must_use]
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Synchronizes a schedule as of now.
    ///
    /// # Errors
    ///
    /// See [`SyncExecutor::run_at`].
    pub async fn run(&self, schedule_id: ScheduleId) -> Result<SyncOutcome, SyncError> {
        self.run_at(schedule_id, Utc::now()).await
    }

    /// Synchronizes a schedule, taking `now` as the current time.
    ///
    /// Nothing is written before the provider has answered, so a failed fetch
    /// leaves the stored events and the last-synced time as they were.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] for everything except a missing schedule, which
    /// is [`SyncOutcome::EntityNotFound`].
    #[instrument(skip_all, fields(%schedule_id))]
    pub async fn run_at(
        &self,
        schedule_id: ScheduleId,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        let mut stage = SyncStage::Resolved;
        let result = self.advance(schedule_id, now, &mut stage).await;

        match &result {
            Ok(SyncOutcome::Completed { courses_count, .. }) => {
                info!(%schedule_id, courses_count, "sync completed");
            }
            Ok(SyncOutcome::EntityNotFound) => {
                info!(%schedule_id, %stage, "schedule gone, recurring sync cancelled");
            }
            Err(error) => {
                warn!(
                    %schedule_id,
                    %stage,
                    next = %SyncStage::Aborted,
                    retryable = error.is_retryable(),
                    %error,
                    "sync aborted"
                );
            }
        }
        result
    }

    async fn advance(
        &self,
        schedule_id: ScheduleId,
        now: DateTime<Utc>,
        stage: &mut SyncStage,
    ) -> Result<SyncOutcome, SyncError> {
        let Some((schedule, record)) = self.load(schedule_id).await? else {
            self.forget(schedule_id).await;
            return Ok(SyncOutcome::EntityNotFound);
        };
        debug!(%schedule_id, provider_id = %schedule.provider_id, %stage, "sync stage");

        let credentials: RawCredentials = self
            .vault
            .open_record(&record)
            .map_err(|source| SyncError::DecryptionFailed {
                schedule_id,
                source,
            })?;
        transition(stage, SyncStage::CredentialsDecrypted, schedule_id);

        let provider = self.registry.resolve(&schedule.provider_id)?;
        let window = FetchWindow::academic_year_containing(now);
        transition(stage, SyncStage::ProviderFetching, schedule_id);

        let fetched = tokio::time::timeout(
            self.fetch_timeout,
            provider.get_schedule(&credentials, window.from, window.to),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout))
        .map_err(|source| SyncError::ProviderFetchFailed {
            provider_id: schedule.provider_id.clone(),
            source,
        })?;
        transition(stage, SyncStage::Reconciling, schedule_id);

        let lease = self
            .lock
            .acquire(schedule_id)
            .await
            .map_err(|source| SyncError::LockUnavailable { source })?;
        let reconciled = self.reconcile(&schedule, fetched, window, now).await;
        if let Err(error) = self.lock.release(lease).await {
            warn!(%schedule_id, %error, "failed to release sync lock");
        }

        match reconciled {
            Ok(courses_count) => {
                transition(stage, SyncStage::Completed, schedule_id);
                Ok(SyncOutcome::Completed {
                    courses_count,
                    window,
                })
            }
            // Deleted while the run was in flight.
            Err(StoreError::NotFound { .. }) => {
                self.forget(schedule_id).await;
                Ok(SyncOutcome::EntityNotFound)
            }
            Err(source) => Err(SyncError::StorageFailure { source }),
        }
    }

    async fn load(
        &self,
        schedule_id: ScheduleId,
    ) -> Result<Option<(ScheduleEntity, CredentialRecord)>, SyncError> {
        let Some(schedule) = self.store.find_schedule(schedule_id).await? else {
            return Ok(None);
        };
        let Some(record) = self.store.find_credential(schedule_id).await? else {
            return Ok(None);
        };
        Ok(Some((schedule, record)))
    }

    async fn reconcile(
        &self,
        schedule: &ScheduleEntity,
        fetched: Vec<FetchedEvent>,
        window: FetchWindow,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let removed = self
            .store
            .delete_events_from(schedule.id, window.from)
            .await?;
        let events: Vec<Event> = fetched
            .into_iter()
            .map(|event| Event::from_fetched(schedule.id, event))
            .collect();
        let written = self.store.insert_events(&events).await?;
        self.store.mark_synced(schedule.id, now).await?;

        debug!(schedule_id = %schedule.id, removed, written, "events reconciled");
        Ok(written)
    }

    async fn forget(&self, schedule_id: ScheduleId) {
        if let Err(error) = self.scheduler.cancel_recurring(schedule_id).await {
            warn!(%schedule_id, %error, "failed to cancel recurring sync of missing schedule");
        }
    }
}

fn transition(stage: &mut SyncStage, next: SyncStage, schedule_id: ScheduleId) {
    debug!(%schedule_id, from = %stage, to = %next, "sync stage");
    *stage = next;
}
