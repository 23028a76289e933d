//! The persistence seam of the synchronization engine.

use crate::error::StoreError;
use crate::model::{Bearer, CredentialRecord, Event, ScheduleEntity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classync_core::{ScheduleId, UserId};

/// Half-open `[from, to)` filter on event start times. Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventRange {
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub to: Option<DateTime<Utc>>,
}

impl EventRange {
    /// No bounds.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Events starting in `[from, to)`.
    #[must_use]
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// Returns whether `start` falls in the range.
    #[must_use]
    pub fn contains(&self, start: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| start >= from) && self.to.is_none_or(|to| start < to)
    }
}

/// Storage of schedules, their sealed credentials, and their events.
///
/// Deleting a schedule removes its credentials, events and access grants.
#[async_trait]
pub trait TimetableStore: Send + Sync {
    /// Inserts a schedule together with its credentials.
    ///
    /// Fails with [`StoreError::AlreadyExists`] when the user already has a
    /// schedule for the same provider and organization.
    async fn create_schedule(
        &self,
        schedule: &ScheduleEntity,
        credential: &CredentialRecord,
    ) -> Result<(), StoreError>;

    /// Gets a schedule by id.
    async fn find_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleEntity>, StoreError>;

    /// Lists every schedule, oldest first.
    async fn list_schedules(&self) -> Result<Vec<ScheduleEntity>, StoreError>;

    /// Lists the schedules owned by a user, oldest first.
    async fn list_schedules_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ScheduleEntity>, StoreError>;

    /// Gets the sealed credentials of a schedule.
    async fn find_credential(
        &self,
        id: ScheduleId,
    ) -> Result<Option<CredentialRecord>, StoreError>;

    /// Replaces the sealed credentials of an existing schedule.
    async fn replace_credential(&self, credential: &CredentialRecord) -> Result<(), StoreError>;

    /// Changes the sync interval of a schedule.
    async fn update_interval(&self, id: ScheduleId, minutes: u32) -> Result<(), StoreError>;

    /// Records a successful sync.
    ///
    /// Fails with [`StoreError::NotFound`] if the schedule no longer exists.
    async fn mark_synced(&self, id: ScheduleId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Deletes a schedule and everything it owns. Returns whether it existed.
    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool, StoreError>;

    /// Deletes the schedule's events starting at or after `from`.
    async fn delete_events_from(
        &self,
        id: ScheduleId,
        from: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Inserts events in bulk. Returns the number of rows written.
    async fn insert_events(&self, events: &[Event]) -> Result<u64, StoreError>;

    /// Lists a schedule's events in `range`, ordered by start.
    async fn list_events(
        &self,
        id: ScheduleId,
        range: EventRange,
    ) -> Result<Vec<Event>, StoreError>;

    /// Lists the schedules a bearer holds a grant for, oldest first.
    ///
    /// Only grants issued by the schedule's owner count.
    async fn granted_schedules(&self, bearer: &Bearer)
    -> Result<Vec<ScheduleEntity>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn range_bounds_are_half_open() {
        let from = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 9, 2, 0, 0, 0).unwrap();
        let range = EventRange::between(from, to);

        assert!(range.contains(from));
        assert!(!range.contains(to));
        assert!(EventRange::all().contains(to));
    }
}
