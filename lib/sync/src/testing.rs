//! Shared fixtures for this crate's tests.

use crate::executor::SyncExecutor;
use crate::service::TimetableService;
use chrono::{DateTime, Duration, TimeZone, Utc};
use classync_core::{ScheduleId, UserId};
use classync_integration::{
    CredentialVault, FixtureProvider, Provider, ProviderRegistry, RawCredentials,
};
use classync_scheduler::{EntityLocks, JobScheduler, MemoryBroker};
use classync_store::{Event, EventRange, FetchedEvent, MemoryStore, ScheduleEntity, TimetableStore};
use std::sync::Arc;

pub(crate) const PROVIDER_ID: &str = "fixture";

pub(crate) fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

/// A one-hour course.
pub(crate) fn course(subject: &str, start: DateTime<Utc>) -> FetchedEvent {
    FetchedEvent::new(subject, start, start + Duration::hours(1))
}

pub(crate) fn credentials() -> RawCredentials {
    RawCredentials::new(serde_json::json!({
        "username": "eleve.martin",
        "password": "hunter2",
    }))
}

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
    pub provider: Arc<FixtureProvider>,
    pub vault: CredentialVault,
    pub registry: ProviderRegistry,
    pub scheduler: JobScheduler,
    pub locks: Arc<EntityLocks>,
}

impl Harness {
    pub fn new() -> Self {
        let provider = Arc::new(FixtureProvider::new(PROVIDER_ID));
        let registry = ProviderRegistry::builder()
            .register(provider.clone() as Arc<dyn Provider>)
            .build()
            .unwrap();
        let broker = Arc::new(MemoryBroker::new());

        Self {
            store: Arc::new(MemoryStore::new()),
            scheduler: JobScheduler::active(broker.clone()),
            broker,
            provider,
            vault: CredentialVault::from_key(&[7u8; 32]).unwrap(),
            registry,
            locks: Arc::new(EntityLocks::new(std::time::Duration::from_secs(5))),
        }
    }

    pub fn executor(&self) -> SyncExecutor {
        SyncExecutor::new(
            self.store.clone(),
            self.vault.clone(),
            self.registry.clone(),
            self.scheduler.clone(),
            self.locks.clone(),
        )
    }

    pub fn service(&self) -> TimetableService {
        TimetableService::new(
            self.store.clone(),
            self.vault.clone(),
            self.registry.clone(),
            self.scheduler.clone(),
        )
    }

    pub async fn seed_schedule(&self) -> ScheduleEntity {
        self.seed_schedule_for(PROVIDER_ID).await
    }

    /// Stores a schedule with sealed credentials, bypassing validation.
    pub async fn seed_schedule_for(&self, provider_id: &str) -> ScheduleEntity {
        let schedule = ScheduleEntity::new(UserId::new(), provider_id, None, 60);
        let record = self
            .vault
            .seal(&credentials())
            .unwrap()
            .into_record(schedule.id);
        self.store.create_schedule(&schedule, &record).await.unwrap();
        schedule
    }

    pub async fn events(&self, schedule_id: ScheduleId) -> Vec<Event> {
        self.store
            .list_events(schedule_id, EventRange::all())
            .await
            .unwrap()
    }
}
