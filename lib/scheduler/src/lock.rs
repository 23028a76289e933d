//! Per-schedule mutual exclusion around reconciliation.

use crate::error::LockError;
use async_trait::async_trait;
use classync_core::ScheduleId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Proof of holding a schedule's sync lock. Hand it back to
/// [`SyncLock::release`].
#[derive(Debug)]
pub struct LockLease {
    pub schedule_id: ScheduleId,
    /// Backend-specific token identifying this acquisition.
    pub token: u64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockLease {
    /// A lease identified by a backend token alone.
    #[must_use]
    pub fn new(schedule_id: ScheduleId, token: u64) -> Self {
        Self {
            schedule_id,
            token,
            guard: None,
        }
    }
}

/// Serializes sync runs for the same schedule.
#[async_trait]
pub trait SyncLock: Send + Sync {
    /// Waits for the schedule's lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if it stays held past the
    /// backend's wait limit.
    async fn acquire(&self, schedule_id: ScheduleId) -> Result<LockLease, LockError>;

    /// Releases a lease from [`SyncLock::acquire`].
    async fn release(&self, lease: LockLease) -> Result<(), LockError>;
}

/// In-process [`SyncLock`] for workers sharing one process.
pub struct EntityLocks {
    locks: Mutex<HashMap<ScheduleId, Arc<Mutex<()>>>>,
    wait: Duration,
}

impl EntityLocks {
    /// Creates a lock table whose acquisitions give up after `wait`.
    #[must_use]
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait,
        }
    }

    /// Number of schedules with a live lock entry.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[async_trait]
impl SyncLock for EntityLocks {
    async fn acquire(&self, schedule_id: ScheduleId) -> Result<LockLease, LockError> {
        let entry = self
            .locks
            .lock()
            .await
            .entry(schedule_id)
            .or_default()
            .clone();

        let guard = tokio::time::timeout(self.wait, entry.lock_owned())
            .await
            .map_err(|_| LockError::Unavailable { schedule_id })?;

        Ok(LockLease {
            schedule_id,
            token: 0,
            guard: Some(guard),
        })
    }

    async fn release(&self, lease: LockLease) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        drop(lease.guard);
        // Drop the entry once no lease or waiter holds it.
        if locks
            .get(&lease.schedule_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&lease.schedule_id);
        }
        Ok(())
    }
}
