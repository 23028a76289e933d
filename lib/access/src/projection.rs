//! Schedules and events a bearer may read.

use crate::error::AccessError;
use classync_store::{Bearer, Event, EventRange, ScheduleEntity, TimetableStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// A granted schedule together with its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisibleSchedule {
    pub schedule: ScheduleEntity,
    /// Ordered by start.
    pub events: Vec<Event>,
}

/// Read-only view of schedules through access grants.
#[derive(Clone)]
pub struct AccessProjection {
    store: Arc<dyn TimetableStore>,
}

impl AccessProjection {
    #[must_use]
    pub fn new(store: Arc<dyn TimetableStore>) -> Self {
        Self { store }
    }

    /// Lists the schedules `bearer` holds a grant for, oldest first, with
    /// their events starting in `range`.
    ///
    /// A bearer without grants sees nothing.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Storage`] if storage fails.
    pub async fn events_visible_to(
        &self,
        bearer: &Bearer,
        range: EventRange,
    ) -> Result<Vec<VisibleSchedule>, AccessError> {
        let schedules = self.store.granted_schedules(bearer).await?;

        let mut visible = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            let events = self.store.list_events(schedule.id, range).await?;
            visible.push(VisibleSchedule { schedule, events });
        }

        debug!(%bearer, schedules = visible.len(), "projected granted schedules");
        Ok(visible)
    }

    /// Like [`AccessProjection::events_visible_to`], for an identity string
    /// such as `oauth:<client id>` or `key:<key id>`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::InvalidIdentity`] for a malformed identity.
    pub async fn events_visible_to_identity(
        &self,
        identity: &str,
        range: EventRange,
    ) -> Result<Vec<VisibleSchedule>, AccessError> {
        let bearer: Bearer = identity.parse()?;
        self.events_visible_to(&bearer, range).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use classync_core::UserId;
    use classync_store::{AccessGrant, CredentialRecord, FetchedEvent, MemoryStore};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, day, hour, 0, 0).unwrap()
    }

    fn client() -> Bearer {
        Bearer::OauthClient {
            client_id: "agenda-app".to_string(),
        }
    }

    async fn schedule_with_events(
        store: &MemoryStore,
        user_id: UserId,
        provider_id: &str,
        starts: &[DateTime<Utc>],
    ) -> ScheduleEntity {
        let schedule = ScheduleEntity::new(user_id, provider_id, None, 60);
        let record = CredentialRecord {
            schedule_id: schedule.id,
            ciphertext: "00:00".to_string(),
            iv: "00".to_string(),
        };
        store.create_schedule(&schedule, &record).await.unwrap();
        let events: Vec<Event> = starts
            .iter()
            .map(|start| {
                Event::from_fetched(
                    schedule.id,
                    FetchedEvent::new("Maths", *start, *start + Duration::hours(1)),
                )
            })
            .collect();
        store.insert_events(&events).await.unwrap();
        schedule
    }

    async fn grant(store: &MemoryStore, bearer: Bearer, schedule: &ScheduleEntity) {
        store
            .insert_grant(AccessGrant {
                bearer,
                user_id: schedule.user_id,
                schedule_id: schedule.id,
            })
            .await;
    }

    #[tokio::test]
    async fn returns_granted_schedules_with_ordered_events() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new();
        let first = schedule_with_events(&store, user, "pronote", &[at(8, 10), at(7, 8)]).await;
        let second = schedule_with_events(&store, user, "skolengo", &[at(9, 8)]).await;
        let _hidden = schedule_with_events(&store, UserId::new(), "pronote", &[at(9, 8)]).await;
        grant(&store, client(), &second).await;
        grant(&store, client(), &first).await;

        let projection = AccessProjection::new(store);
        let visible = projection
            .events_visible_to(&client(), EventRange::all())
            .await
            .unwrap();

        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].schedule.id, first.id);
        assert_eq!(visible[1].schedule.id, second.id);
        let starts: Vec<_> = visible[0].events.iter().map(|e| e.starts_at).collect();
        assert_eq!(starts, vec![at(7, 8), at(8, 10)]);
    }

    #[tokio::test]
    async fn range_filters_event_starts() {
        let store = Arc::new(MemoryStore::new());
        let schedule =
            schedule_with_events(&store, UserId::new(), "pronote", &[at(7, 8), at(8, 8), at(9, 8)])
                .await;
        grant(&store, client(), &schedule).await;

        let visible = AccessProjection::new(store)
            .events_visible_to(&client(), EventRange::between(at(8, 0), at(9, 0)))
            .await
            .unwrap();

        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].events.len(), 1);
        assert_eq!(visible[0].events[0].starts_at, at(8, 8));
    }

    #[tokio::test]
    async fn grants_are_per_bearer() {
        let store = Arc::new(MemoryStore::new());
        let schedule = schedule_with_events(&store, UserId::new(), "pronote", &[at(7, 8)]).await;
        grant(&store, client(), &schedule).await;
        let projection = AccessProjection::new(store);

        let key = Bearer::ApiKey {
            key_id: "k-1".to_string(),
        };
        assert!(
            projection
                .events_visible_to(&key, EventRange::all())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn grants_from_other_users_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let schedule = schedule_with_events(&store, UserId::new(), "pronote", &[at(7, 8)]).await;
        store
            .insert_grant(AccessGrant {
                bearer: client(),
                user_id: UserId::new(),
                schedule_id: schedule.id,
            })
            .await;

        let visible = AccessProjection::new(store)
            .events_visible_to(&client(), EventRange::all())
            .await
            .unwrap();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn deleted_schedules_disappear() {
        let store = Arc::new(MemoryStore::new());
        let schedule = schedule_with_events(&store, UserId::new(), "pronote", &[at(7, 8)]).await;
        grant(&store, client(), &schedule).await;
        store.delete_schedule(schedule.id).await.unwrap();

        let visible = AccessProjection::new(store)
            .events_visible_to(&client(), EventRange::all())
            .await
            .unwrap();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn identity_strings_are_parsed() {
        let store = Arc::new(MemoryStore::new());
        let schedule = schedule_with_events(&store, UserId::new(), "pronote", &[at(7, 8)]).await;
        grant(&store, client(), &schedule).await;
        let projection = AccessProjection::new(store);

        let visible = projection
            .events_visible_to_identity("oauth:agenda-app", EventRange::all())
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);

        assert_eq!(
            projection
                .events_visible_to_identity("session:abc", EventRange::all())
                .await,
            Err(AccessError::InvalidIdentity {
                input: "session:abc".to_string()
            })
        );
    }

    #[tokio::test]
    async fn storage_failures_propagate() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let err = AccessProjection::new(store)
            .events_visible_to(&client(), EventRange::all())
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Storage { .. }));
    }
}
