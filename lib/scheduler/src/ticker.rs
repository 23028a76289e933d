//! Turns due recurring registrations into queued jobs.

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::job::SyncJob;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Periodically enqueues jobs for due recurring registrations.
///
/// Any number of tickers may run against the same broker. Each due slot is
/// enqueued with the dedup id `sync-<id>@<slot millis>`, and the
/// registration is advanced by compare-and-swap on its revision, so
/// concurrent tickers produce one job per slot.
pub struct RecurringTicker {
    broker: Arc<dyn Broker>,
    period: Duration,
}

impl RecurringTicker {
    /// Creates a ticker checking registrations every `period`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, period: Duration) -> Self {
        Self { broker, period }
    }

    /// Enqueues every slot due at `now`. Returns the number of jobs enqueued.
    ///
    /// # Errors
    ///
    /// Returns an error if the registrations cannot be listed. Failures on
    /// individual registrations are logged and left for the next tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, BrokerError> {
        let mut enqueued = 0;

        for entry in self.broker.list_repeatable().await? {
            let registration = &entry.registration;
            if !registration.is_due(now) {
                continue;
            }

            // Enqueue before advancing: a failed advance must not lose the slot.
            let job = SyncJob::recurring(registration.schedule_id, registration.next_run_at);
            let dedup_id = job.dedup_id();
            if let Err(e) = self.broker.enqueue(job, dedup_id).await {
                warn!(
                    schedule_id = %registration.schedule_id,
                    error = %e,
                    "failed to enqueue recurring sync"
                );
                continue;
            }

            let next_run_at = registration.next_slot_after(now);
            match self
                .broker
                .advance_repeatable(&registration.key, entry.revision, next_run_at)
                .await
            {
                Ok(true) => {
                    enqueued += 1;
                    debug!(
                        schedule_id = %registration.schedule_id,
                        %next_run_at,
                        "recurring sync enqueued"
                    );
                }
                Ok(false) => {
                    debug!(
                        schedule_id = %registration.schedule_id,
                        "registration changed concurrently, slot left to its new owner"
                    );
                }
                Err(e) => {
                    warn!(
                        schedule_id = %registration.schedule_id,
                        error = %e,
                        "failed to advance recurring registration"
                    );
                }
            }
        }

        Ok(enqueued)
    }

    /// Ticks every period until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(period_secs = self.period.as_secs(), "recurring ticker started");
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(error = %e, "failed to list recurring registrations");
                    }
                }
            }
        }
        info!("recurring ticker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::RecurringRegistration;
    use crate::job::JobTrigger;
    use crate::memory::MemoryBroker;
    use chrono::TimeZone;
    use classync_core::ScheduleId;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, hour, minute, 0).unwrap()
    }

    async fn registered(broker: &MemoryBroker, minutes: u32) -> ScheduleId {
        let id = ScheduleId::new();
        broker
            .add_repeatable(RecurringRegistration::every_minutes(id, minutes, at(8, 0)))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn enqueues_only_due_registrations() {
        let broker = Arc::new(MemoryBroker::new());
        let hourly = registered(&broker, 60).await;
        registered(&broker, 120).await;
        let ticker = RecurringTicker::new(broker.clone(), Duration::from_secs(30));

        assert_eq!(ticker.tick(at(8, 30)).await.unwrap(), 0);
        assert_eq!(ticker.tick(at(9, 0)).await.unwrap(), 1);

        let jobs = broker.pending_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule_id, hourly);
        assert_eq!(jobs[0].trigger, JobTrigger::Recurring { slot: at(9, 0) });

        let reg = broker
            .list_repeatable()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.registration.schedule_id == hourly)
            .unwrap();
        assert_eq!(reg.registration.next_run_at, at(10, 0));
    }

    #[tokio::test]
    async fn slot_fires_once() {
        let broker = Arc::new(MemoryBroker::new());
        registered(&broker, 60).await;
        let ticker = RecurringTicker::new(broker.clone(), Duration::from_secs(30));

        ticker.tick(at(9, 0)).await.unwrap();
        ticker.tick(at(9, 1)).await.unwrap();

        assert_eq!(broker.pending_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_tickers_enqueue_one_job_per_slot() {
        let broker = Arc::new(MemoryBroker::new());
        registered(&broker, 60).await;
        let a = RecurringTicker::new(broker.clone(), Duration::from_secs(30));
        let b = RecurringTicker::new(broker.clone(), Duration::from_secs(30));

        let (ra, rb) = tokio::join!(a.tick(at(9, 0)), b.tick(at(9, 0)));

        assert_eq!(ra.unwrap() + rb.unwrap(), 1);
        assert_eq!(broker.pending_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn missed_slots_collapse_into_one_run() {
        let broker = Arc::new(MemoryBroker::new());
        registered(&broker, 15).await;
        let ticker = RecurringTicker::new(broker.clone(), Duration::from_secs(30));

        assert_eq!(ticker.tick(at(10, 0)).await.unwrap(), 1);
        assert_eq!(broker.pending_jobs().await.len(), 1);
        let reg = broker.list_repeatable().await.unwrap().remove(0);
        assert_eq!(reg.registration.next_run_at, at(10, 15));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        let ticker = RecurringTicker::new(broker, Duration::from_millis(10));
        tokio::time::timeout(
            Duration::from_secs(5),
            ticker.run(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .expect("ticker stops");
    }
}
