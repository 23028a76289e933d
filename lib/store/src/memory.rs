//! In-memory [`TimetableStore`] for tests and local runs.

use crate::error::StoreError;
use crate::model::{AccessGrant, Bearer, CredentialRecord, Event, ScheduleEntity};
use crate::store::{EventRange, TimetableStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classync_core::{ScheduleId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    schedules: HashMap<ScheduleId, ScheduleEntity>,
    credentials: HashMap<ScheduleId, CredentialRecord>,
    events: Vec<Event>,
    grants: Vec<AccessGrant>,
}

impl State {
    fn sorted(mut schedules: Vec<ScheduleEntity>) -> Vec<ScheduleEntity> {
        schedules.sort_by_key(|s| (s.created_at, s.id.as_ulid()));
        schedules
    }
}

/// A [`TimetableStore`] keeping everything behind an async lock.
///
/// Grants can be inserted with [`MemoryStore::insert_grant`], standing in
/// for the authorization system that owns them.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with [`StoreError::Database`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Records an access grant.
    pub async fn insert_grant(&self, grant: AccessGrant) {
        let mut state = self.state.write().await;
        if !state.grants.contains(&grant) {
            state.grants.push(grant);
        }
    }

    /// Number of stored events across all schedules.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.events.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database {
                reason: "store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TimetableStore for MemoryStore {
    async fn create_schedule(
        &self,
        schedule: &ScheduleEntity,
        credential: &CredentialRecord,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.schedules.values().any(|s| s.same_slot(schedule)) {
            return Err(StoreError::AlreadyExists {
                provider_id: schedule.provider_id.clone(),
                organization_id: schedule.organization_id.clone(),
            });
        }
        state.schedules.insert(schedule.id, schedule.clone());
        state.credentials.insert(schedule.id, credential.clone());
        Ok(())
    }

    async fn find_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleEntity>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleEntity>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(State::sorted(state.schedules.values().cloned().collect()))
    }

    async fn list_schedules_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ScheduleEntity>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(State::sorted(
            state
                .schedules
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect(),
        ))
    }

    async fn find_credential(
        &self,
        id: ScheduleId,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.credentials.get(&id).cloned())
    }

    async fn replace_credential(&self, credential: &CredentialRecord) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if !state.schedules.contains_key(&credential.schedule_id) {
            return Err(StoreError::NotFound {
                id: credential.schedule_id,
            });
        }
        state
            .credentials
            .insert(credential.schedule_id, credential.clone());
        Ok(())
    }

    async fn update_interval(&self, id: ScheduleId, minutes: u32) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let schedule = state
            .schedules
            .get_mut(&id)
            .ok_or(StoreError::NotFound { id })?;
        schedule.sync_interval_minutes = minutes;
        Ok(())
    }

    async fn mark_synced(&self, id: ScheduleId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let schedule = state
            .schedules
            .get_mut(&id)
            .ok_or(StoreError::NotFound { id })?;
        schedule.last_synced_at = Some(at);
        Ok(())
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let existed = state.schedules.remove(&id).is_some();
        state.credentials.remove(&id);
        state.events.retain(|e| e.schedule_id != id);
        state.grants.retain(|g| g.schedule_id != id);
        Ok(existed)
    }

    async fn delete_events_from(
        &self,
        id: ScheduleId,
        from: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let before = state.events.len();
        state
            .events
            .retain(|e| e.schedule_id != id || e.starts_at < from);
        Ok((before - state.events.len()) as u64)
    }

    async fn insert_events(&self, events: &[Event]) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(orphan) = events
            .iter()
            .find(|e| !state.schedules.contains_key(&e.schedule_id))
        {
            return Err(StoreError::NotFound {
                id: orphan.schedule_id,
            });
        }
        state.events.extend_from_slice(events);
        Ok(events.len() as u64)
    }

    async fn list_events(
        &self,
        id: ScheduleId,
        range: EventRange,
    ) -> Result<Vec<Event>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| e.schedule_id == id && range.contains(e.starts_at))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.starts_at, e.id.as_ulid()));
        Ok(events)
    }

    async fn granted_schedules(
        &self,
        bearer: &Bearer,
    ) -> Result<Vec<ScheduleEntity>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let granted = state
            .grants
            .iter()
            .filter(|g| &g.bearer == bearer)
            .filter_map(|g| {
                state
                    .schedules
                    .get(&g.schedule_id)
                    .filter(|s| s.user_id == g.user_id)
                    .cloned()
            })
            .collect();
        Ok(State::sorted(granted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FetchedEvent;
    use chrono::TimeZone;

    fn sealed(schedule: &ScheduleEntity) -> CredentialRecord {
        CredentialRecord {
            schedule_id: schedule.id,
            ciphertext: "00:11".to_string(),
            iv: "22".to_string(),
        }
    }

    fn event(schedule_id: ScheduleId, month: u32, day: u32) -> Event {
        let start = Utc.with_ymd_and_hms(2024, month, day, 8, 0, 0).unwrap();
        Event::from_fetched(
            schedule_id,
            FetchedEvent::new("Maths", start, start + chrono::Duration::hours(1)),
        )
    }

    #[tokio::test]
    async fn duplicate_slot_is_rejected() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let first = ScheduleEntity::new(user, "pronote", Some("A".to_string()), 60);
        let second = ScheduleEntity::new(user, "pronote", Some("A".to_string()), 30);
        let other_org = ScheduleEntity::new(user, "pronote", Some("B".to_string()), 30);

        store.create_schedule(&first, &sealed(&first)).await.unwrap();
        let err = store
            .create_schedule(&second, &sealed(&second))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        store
            .create_schedule(&other_org, &sealed(&other_org))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_events_from_keeps_earlier_events() {
        let store = MemoryStore::new();
        let schedule = ScheduleEntity::new(UserId::new(), "pronote", None, 60);
        store
            .create_schedule(&schedule, &sealed(&schedule))
            .await
            .unwrap();
        store
            .insert_events(&[event(schedule.id, 6, 1), event(schedule.id, 10, 1)])
            .await
            .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();
        let deleted = store.delete_events_from(schedule.id, cutoff).await.unwrap();

        assert_eq!(deleted, 1);
        let left = store
            .list_events(schedule.id, EventRange::all())
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].starts_at < cutoff);
    }

    #[tokio::test]
    async fn delete_schedule_cascades() {
        let store = MemoryStore::new();
        let schedule = ScheduleEntity::new(UserId::new(), "pronote", None, 60);
        store
            .create_schedule(&schedule, &sealed(&schedule))
            .await
            .unwrap();
        store
            .insert_events(&[event(schedule.id, 10, 1)])
            .await
            .unwrap();
        store
            .insert_grant(AccessGrant {
                bearer: Bearer::ApiKey {
                    key_id: "k".to_string(),
                },
                user_id: schedule.user_id,
                schedule_id: schedule.id,
            })
            .await;

        assert!(store.delete_schedule(schedule.id).await.unwrap());
        assert!(store.find_credential(schedule.id).await.unwrap().is_none());
        assert_eq!(store.event_count().await, 0);
        let granted = store
            .granted_schedules(&Bearer::ApiKey {
                key_id: "k".to_string(),
            })
            .await
            .unwrap();
        assert!(granted.is_empty());
        assert!(!store.delete_schedule(schedule.id).await.unwrap());
    }

    #[tokio::test]
    async fn mark_synced_on_missing_schedule_is_not_found() {
        let store = MemoryStore::new();
        let id = ScheduleId::new();
        let err = store.mark_synced(id, Utc::now()).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound { id });
    }

    #[tokio::test]
    async fn grants_from_non_owner_are_ignored() {
        let store = MemoryStore::new();
        let schedule = ScheduleEntity::new(UserId::new(), "pronote", None, 60);
        store
            .create_schedule(&schedule, &sealed(&schedule))
            .await
            .unwrap();
        let bearer = Bearer::OauthClient {
            client_id: "app".to_string(),
        };
        store
            .insert_grant(AccessGrant {
                bearer: bearer.clone(),
                user_id: UserId::new(),
                schedule_id: schedule.id,
            })
            .await;

        assert!(store.granted_schedules(&bearer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_operations() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.list_schedules().await.unwrap_err();
        assert!(matches!(err, StoreError::Database { .. }));
        store.set_unavailable(false);
        assert!(store.list_schedules().await.unwrap().is_empty());
    }
}
