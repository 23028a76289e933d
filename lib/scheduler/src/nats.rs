//! NATS JetStream implementation of the broker.
//!
//! - Jobs are published to `classync.sync.<schedule id>` on a work-queue
//!   stream, so a job stays in the stream until a worker acknowledges it
//! - Recurring registrations live in a key-value bucket keyed by
//!   `sync-<schedule id>`
//! - Workers share one durable pull consumer with explicit acks
//! - Sync locks are leases in a second key-value bucket whose entries expire

use crate::broker::{Broker, DUPLICATE_WINDOW, RecurringRegistration, RegisteredJob};
use crate::envelope::Envelope;
use crate::error::{BrokerError, LockError};
use crate::job::{JobDisposition, JobHandler, SyncJob, job_key};
use crate::lock::{LockLease, SyncLock};
use async_nats::HeaderMap;
use async_nats::jetstream::{self, AckKind, consumer, kv, stream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classync_core::ScheduleId;
use futures::{StreamExt, TryStreamExt};
use rootcause::prelude::Report;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Subject prefix for sync jobs.
const JOB_SUBJECT_PREFIX: &str = "classync.sync";

/// Stream name for sync jobs.
const WORK_STREAM_NAME: &str = "CLASSYNC_JOBS";

/// Key-value bucket for recurring registrations.
const RECURRING_BUCKET_NAME: &str = "classync-recurring";

/// Key-value bucket for sync locks.
const LOCK_BUCKET_NAME: &str = "classync-locks";

/// Durable consumer shared by all workers.
const CONSUMER_NAME: &str = "classync-workers";

/// Longest redelivery delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Poll interval while waiting for a held lock.
const LOCK_POLL: Duration = Duration::from_millis(250);

/// Configuration for the NATS broker.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream name for jobs (defaults to CLASSYNC_JOBS).
    pub work_stream_name: Option<String>,
    /// Bucket for recurring registrations (defaults to classync-recurring).
    pub recurring_bucket_name: Option<String>,
    /// Bucket for sync locks (defaults to classync-locks).
    pub lock_bucket_name: Option<String>,
    /// Durable consumer name (defaults to classync-workers).
    pub consumer_name: Option<String>,
}

impl NatsConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            work_stream_name: None,
            recurring_bucket_name: None,
            lock_bucket_name: None,
            consumer_name: None,
        }
    }

    fn work_stream(&self) -> &str {
        self.work_stream_name.as_deref().unwrap_or(WORK_STREAM_NAME)
    }

    fn recurring_bucket(&self) -> &str {
        self.recurring_bucket_name
            .as_deref()
            .unwrap_or(RECURRING_BUCKET_NAME)
    }

    fn lock_bucket(&self) -> &str {
        self.lock_bucket_name.as_deref().unwrap_or(LOCK_BUCKET_NAME)
    }

    fn consumer(&self) -> &str {
        self.consumer_name.as_deref().unwrap_or(CONSUMER_NAME)
    }
}

fn registry_error(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::RegistryFailed {
        reason: e.to_string(),
    }
}

fn publish_error(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::PublishFailed {
        reason: e.to_string(),
    }
}

async fn open_bucket(
    jetstream: &jetstream::Context,
    config: kv::Config,
) -> Result<kv::Store, BrokerError> {
    if let Ok(store) = jetstream.get_key_value(config.bucket.clone()).await {
        return Ok(store);
    }
    let bucket = config.bucket.clone();
    jetstream
        .create_key_value(config)
        .await
        .map_err(|e| BrokerError::ConnectionFailed {
            reason: format!("failed to create bucket {bucket}: {e}"),
        })
}

/// JetStream-backed [`Broker`].
pub struct NatsBroker {
    jetstream: jetstream::Context,
    stream: stream::Stream,
    recurring: kv::Store,
    config: NatsConfig,
}

impl NatsBroker {
    /// Connects and ensures the stream and bucket exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or setup fails.
    pub async fn connect(config: NatsConfig) -> Result<Self, Report<BrokerError>> {
        let client = async_nats::connect(&config.url).await.map_err(|e| {
            BrokerError::ConnectionFailed {
                reason: e.to_string(),
            }
        })?;
        let jetstream = jetstream::new(client);

        let stream = jetstream
            .get_or_create_stream(stream::Config {
                name: config.work_stream().to_string(),
                subjects: vec![format!("{JOB_SUBJECT_PREFIX}.>")],
                storage: stream::StorageType::File,
                retention: stream::RetentionPolicy::WorkQueue,
                duplicate_window: DUPLICATE_WINDOW,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                reason: format!("failed to create work stream: {e}"),
            })?;

        let recurring = open_bucket(
            &jetstream,
            kv::Config {
                bucket: config.recurring_bucket().to_string(),
                history: 1,
                ..Default::default()
            },
        )
        .await?;

        info!(url = %config.url, stream = config.work_stream(), "connected to NATS");
        Ok(Self {
            jetstream,
            stream,
            recurring,
            config,
        })
    }

    /// Returns the subject for a schedule's jobs.
    fn job_subject(schedule_id: ScheduleId) -> String {
        format!("{JOB_SUBJECT_PREFIX}.{schedule_id}")
    }

    /// Opens the shared durable consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot be created.
    pub async fn consumer(
        &self,
        settings: ConsumerSettings,
    ) -> Result<NatsConsumer, Report<BrokerError>> {
        let name = self.config.consumer();
        let consumer = self
            .stream
            .get_or_create_consumer(
                name,
                consumer::pull::Config {
                    durable_name: Some(name.to_string()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: settings.ack_wait,
                    max_deliver: i64::from(settings.max_deliver),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                reason: format!("failed to create consumer: {e}"),
            })?;

        Ok(NatsConsumer { consumer, settings })
    }

    /// Opens the lock bucket. Leases expire after `ttl` if never released.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket cannot be created.
    pub async fn sync_lock(
        &self,
        ttl: Duration,
        wait: Duration,
    ) -> Result<NatsSyncLock, Report<BrokerError>> {
        let bucket = open_bucket(
            &self.jetstream,
            kv::Config {
                bucket: self.config.lock_bucket().to_string(),
                history: 1,
                max_age: ttl,
                ..Default::default()
            },
        )
        .await?;

        Ok(NatsSyncLock { bucket, wait })
    }

    async fn read_registration(
        &self,
        key: &str,
    ) -> Result<Option<RegisteredJob>, BrokerError> {
        let Some(entry) = self.recurring.entry(key).await.map_err(registry_error)? else {
            return Ok(None);
        };
        if !matches!(entry.operation, kv::Operation::Put) {
            return Ok(None);
        }
        let registration = Envelope::<RecurringRegistration>::from_json_bytes(&entry.value)
            .map_err(|e| BrokerError::DecodeFailed {
                reason: format!("registration {key}: {e}"),
            })?
            .into_payload();

        Ok(Some(RegisteredJob {
            registration,
            revision: entry.revision,
        }))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    #[instrument(skip(self, job), fields(schedule_id = %job.schedule_id))]
    async fn enqueue(&self, job: SyncJob, dedup_id: Option<String>) -> Result<(), BrokerError> {
        let subject = Self::job_subject(job.schedule_id);
        let bytes = Envelope::new(job).to_json_bytes().map_err(publish_error)?;

        let ack = match dedup_id {
            Some(id) => {
                let mut headers = HeaderMap::new();
                headers.insert("Nats-Msg-Id", id.as_str());
                self.jetstream
                    .publish_with_headers(subject, headers, bytes.into())
                    .await
            }
            None => self.jetstream.publish(subject, bytes.into()).await,
        }
        .map_err(publish_error)?;

        let ack = ack.await.map_err(publish_error)?;
        if ack.duplicate {
            debug!("duplicate job dropped by the broker");
        }
        Ok(())
    }

    async fn add_repeatable(
        &self,
        registration: RecurringRegistration,
    ) -> Result<(), BrokerError> {
        let key = registration.key.clone();
        let bytes = Envelope::new(registration)
            .to_json_bytes()
            .map_err(registry_error)?;
        self.recurring
            .put(key.as_str(), bytes.into())
            .await
            .map_err(registry_error)?;
        Ok(())
    }

    async fn remove_repeatable(&self, key: &str) -> Result<bool, BrokerError> {
        if self.recurring.get(key).await.map_err(registry_error)?.is_none() {
            return Ok(false);
        }
        self.recurring.delete(key).await.map_err(registry_error)?;
        Ok(true)
    }

    async fn list_repeatable(&self) -> Result<Vec<RegisteredJob>, BrokerError> {
        let keys: Vec<String> = self
            .recurring
            .keys()
            .await
            .map_err(registry_error)?
            .try_collect()
            .await
            .map_err(registry_error)?;

        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read_registration(&key).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(BrokerError::DecodeFailed { reason }) => {
                    warn!(%key, %reason, "skipping undecodable registration");
                }
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by(|a, b| a.registration.key.cmp(&b.registration.key));
        Ok(jobs)
    }

    async fn advance_repeatable(
        &self,
        key: &str,
        revision: u64,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        let Some(current) = self.read_registration(key).await? else {
            return Ok(false);
        };
        if current.revision != revision {
            return Ok(false);
        }

        let mut registration = current.registration;
        registration.next_run_at = next_run_at;
        let bytes = Envelope::new(registration)
            .to_json_bytes()
            .map_err(registry_error)?;

        match self.recurring.update(key, bytes.into(), revision).await {
            Ok(_) => Ok(true),
            Err(e) => {
                // A revision mismatch means another writer got there first.
                match self.read_registration(key).await? {
                    Some(now) if now.revision == revision => Err(registry_error(e)),
                    _ => Ok(false),
                }
            }
        }
    }

    async fn is_pending(&self, schedule_id: ScheduleId) -> Result<bool, BrokerError> {
        let subject = Self::job_subject(schedule_id);
        match self.stream.get_last_raw_message_by_subject(&subject).await {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), stream::LastRawMessageErrorKind::NoMessageFound) => {
                Ok(false)
            }
            Err(e) => Err(BrokerError::RegistryFailed {
                reason: format!("failed to look up pending jobs: {e}"),
            }),
        }
    }
}

/// Delivery settings of the worker consumer.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Jobs processed at once.
    pub concurrency: usize,
    /// Deliveries before a job is dead-lettered.
    pub max_deliver: u32,
    /// How long a delivery may stay unacknowledged before redelivery.
    pub ack_wait: Duration,
    /// Delay before the first redelivery; doubles on each attempt.
    pub retry_base: Duration,
}

impl ConsumerSettings {
    /// Redelivery delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base
            .saturating_mul(1 << exponent)
            .min(MAX_RETRY_DELAY)
    }

    /// How to acknowledge a delivery given the handler's verdict.
    fn ack_for(&self, disposition: &JobDisposition, attempt: u32) -> AckKind {
        match disposition {
            JobDisposition::Done => AckKind::Ack,
            JobDisposition::Retry { .. } if attempt < self.max_deliver => {
                AckKind::Nak(Some(self.retry_delay(attempt)))
            }
            JobDisposition::Retry { .. } | JobDisposition::Fatal { .. } => AckKind::Term,
        }
    }
}

/// The worker side of [`NatsBroker`].
pub struct NatsConsumer {
    consumer: consumer::PullConsumer,
    settings: ConsumerSettings,
}

impl NatsConsumer {
    /// Delivers jobs to `handler` until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the message stream cannot be opened.
    pub async fn run(
        &self,
        handler: Arc<dyn JobHandler>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BrokerError> {
        let messages = self
            .consumer
            .messages()
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                reason: format!("failed to open message stream: {e}"),
            })?;

        let settings = &self.settings;
        let work = messages.for_each_concurrent(settings.concurrency.max(1), |message| {
            let handler = handler.clone();
            async move {
                match message {
                    Ok(message) => process(message, handler.as_ref(), settings).await,
                    Err(e) => warn!(error = %e, "failed to receive job"),
                }
            }
        });

        info!(concurrency = settings.concurrency, "sync consumer started");
        tokio::select! {
            () = work => warn!("job stream ended"),
            () = shutdown => info!("sync consumer stopping"),
        }
        Ok(())
    }
}

async fn process(message: jetstream::Message, handler: &dyn JobHandler, settings: &ConsumerSettings) {
    let attempt = message
        .info()
        .ok()
        .and_then(|info| u32::try_from(info.delivered).ok())
        .unwrap_or(1);

    let job = match Envelope::<SyncJob>::from_json_bytes(&message.payload) {
        Ok(envelope) => envelope.into_payload(),
        Err(e) => {
            error!(subject = %message.subject, error = %e, "dropping undecodable job");
            if let Err(e) = message.ack_with(AckKind::Term).await {
                warn!(error = %e, "failed to terminate job");
            }
            return;
        }
    };

    let disposition = handler.handle(&job).await;
    let ack = settings.ack_for(&disposition, attempt);
    match (&disposition, &ack) {
        (JobDisposition::Retry { reason }, AckKind::Nak(delay)) => warn!(
            schedule_id = %job.schedule_id,
            attempt,
            retry_in_secs = delay.map(|d| d.as_secs()),
            %reason,
            "sync job failed, will retry"
        ),
        (JobDisposition::Retry { reason } | JobDisposition::Fatal { reason }, _) => error!(
            schedule_id = %job.schedule_id,
            attempt,
            %reason,
            "sync job dead-lettered"
        ),
        _ => {}
    }

    if let Err(e) = message.ack_with(ack).await {
        warn!(schedule_id = %job.schedule_id, error = %e, "failed to acknowledge job");
    }
}

/// [`SyncLock`] shared by every worker connected to the same NATS server.
pub struct NatsSyncLock {
    bucket: kv::Store,
    wait: Duration,
}

#[async_trait]
impl SyncLock for NatsSyncLock {
    async fn acquire(&self, schedule_id: ScheduleId) -> Result<LockLease, LockError> {
        let key = job_key(schedule_id);
        let deadline = Instant::now() + self.wait;

        loop {
            let holder = Utc::now().to_rfc3339().into_bytes();
            match self.bucket.create(key.as_str(), holder.into()).await {
                Ok(revision) => return Ok(LockLease::new(schedule_id, revision)),
                Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => {}
                Err(e) => {
                    return Err(LockError::Backend {
                        reason: e.to_string(),
                    });
                }
            }

            if Instant::now() + LOCK_POLL > deadline {
                return Err(LockError::Unavailable { schedule_id });
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    async fn release(&self, lease: LockLease) -> Result<(), LockError> {
        let key = job_key(lease.schedule_id);
        self.bucket
            .delete_expect_revision(key.as_str(), Some(lease.token))
            .await
            .map_err(|e| LockError::Backend {
                reason: format!("lease for {} was lost: {e}", lease.schedule_id),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            concurrency: 4,
            max_deliver: 3,
            ack_wait: Duration::from_secs(300),
            retry_base: Duration::from_secs(30),
        }
    }

    #[test]
    fn nats_config_defaults() {
        let config = NatsConfig::new("nats://localhost:4222");

        assert_eq!(config.work_stream(), WORK_STREAM_NAME);
        assert_eq!(config.recurring_bucket(), RECURRING_BUCKET_NAME);
        assert_eq!(config.lock_bucket(), LOCK_BUCKET_NAME);
        assert_eq!(config.consumer(), CONSUMER_NAME);
    }

    #[test]
    fn nats_config_custom() {
        let config = NatsConfig {
            url: "nats://localhost:4222".to_string(),
            work_stream_name: Some("JOBS".to_string()),
            recurring_bucket_name: Some("recurring".to_string()),
            lock_bucket_name: Some("locks".to_string()),
            consumer_name: Some("workers".to_string()),
        };

        assert_eq!(config.work_stream(), "JOBS");
        assert_eq!(config.recurring_bucket(), "recurring");
        assert_eq!(config.lock_bucket(), "locks");
        assert_eq!(config.consumer(), "workers");
    }

    #[test]
    fn job_subject_format() {
        let id = ScheduleId::new();
        assert_eq!(NatsBroker::job_subject(id), format!("classync.sync.{id}"));
    }

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        let s = settings();
        assert_eq!(s.retry_delay(1), Duration::from_secs(30));
        assert_eq!(s.retry_delay(2), Duration::from_secs(60));
        assert_eq!(s.retry_delay(3), Duration::from_secs(120));
        assert_eq!(s.retry_delay(40), MAX_RETRY_DELAY);
    }

    #[test]
    fn ack_follows_disposition() {
        let s = settings();
        let retry = JobDisposition::Retry {
            reason: "down".to_string(),
        };
        let fatal = JobDisposition::Fatal {
            reason: "bad key".to_string(),
        };

        assert!(matches!(s.ack_for(&JobDisposition::Done, 1), AckKind::Ack));
        assert!(matches!(
            s.ack_for(&retry, 1),
            AckKind::Nak(Some(d)) if d == Duration::from_secs(30)
        ));
        assert!(matches!(s.ack_for(&retry, 3), AckKind::Term));
        assert!(matches!(s.ack_for(&fatal, 1), AckKind::Term));
    }

    /// Tests against a live server. Run with
    /// `NATS_URL=nats://localhost:4222 cargo test -- --ignored`.
    mod live {
        use super::*;

        fn nats_url() -> String {
            std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
        }

        async fn broker_with_lock_bucket(bucket: &str) -> NatsBroker {
            let mut config = NatsConfig::new(nats_url());
            config.lock_bucket_name = Some(bucket.to_string());
            NatsBroker::connect(config).await.unwrap()
        }

        fn bucket_name(case: &str) -> String {
            format!("classync-locks-{case}-{}", ScheduleId::new().as_ulid())
        }

        #[tokio::test]
        #[ignore = "requires a NATS server at NATS_URL"]
        async fn held_lease_blocks_second_acquire() {
            let bucket = bucket_name("contention");
            let broker = broker_with_lock_bucket(&bucket).await;
            let lock = broker
                .sync_lock(Duration::from_secs(60), Duration::from_millis(600))
                .await
                .unwrap();
            let id = ScheduleId::new();

            let lease = lock.acquire(id).await.unwrap();
            let started = Instant::now();
            let second = lock.acquire(id).await;
            assert!(matches!(
                second,
                Err(LockError::Unavailable { schedule_id }) if schedule_id == id
            ));
            assert!(started.elapsed() >= Duration::from_millis(250));

            // Other schedules are unaffected.
            let other = lock.acquire(ScheduleId::new()).await.unwrap();
            lock.release(other).await.unwrap();

            lock.release(lease).await.unwrap();
            let again = lock.acquire(id).await.unwrap();
            lock.release(again).await.unwrap();

            broker.jetstream.delete_key_value(&bucket).await.unwrap();
        }

        #[tokio::test]
        #[ignore = "requires a NATS server at NATS_URL"]
        async fn waiting_acquire_succeeds_once_released() {
            let bucket = bucket_name("handoff");
            let broker = broker_with_lock_bucket(&bucket).await;
            let lock = Arc::new(
                broker
                    .sync_lock(Duration::from_secs(60), Duration::from_secs(5))
                    .await
                    .unwrap(),
            );
            let id = ScheduleId::new();

            let lease = lock.acquire(id).await.unwrap();
            let waiter = tokio::spawn({
                let lock = lock.clone();
                async move { lock.acquire(id).await }
            });
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(!waiter.is_finished());

            lock.release(lease).await.unwrap();
            let handed_over = waiter.await.unwrap().unwrap();
            lock.release(handed_over).await.unwrap();

            broker.jetstream.delete_key_value(&bucket).await.unwrap();
        }

        #[tokio::test]
        #[ignore = "requires a NATS server at NATS_URL"]
        async fn stale_release_leaves_current_holder_alone() {
            let bucket = bucket_name("stale");
            let broker = broker_with_lock_bucket(&bucket).await;
            let lock = broker
                .sync_lock(Duration::from_secs(60), Duration::from_millis(300))
                .await
                .unwrap();
            let id = ScheduleId::new();

            let first = lock.acquire(id).await.unwrap();
            let stale_token = first.token;
            lock.release(first).await.unwrap();
            let current = lock.acquire(id).await.unwrap();
            assert_ne!(current.token, stale_token);

            let stale = lock.release(LockLease::new(id, stale_token)).await;
            assert!(matches!(stale, Err(LockError::Backend { .. })));
            assert!(matches!(
                lock.acquire(id).await,
                Err(LockError::Unavailable { .. })
            ));

            lock.release(current).await.unwrap();
            broker.jetstream.delete_key_value(&bucket).await.unwrap();
        }

        #[tokio::test]
        #[ignore = "requires a NATS server at NATS_URL"]
        async fn duplicate_message_ids_are_dropped() {
            let broker = NatsBroker::connect(NatsConfig::new(nats_url()))
                .await
                .unwrap();
            let id = ScheduleId::new();
            let job = SyncJob::recurring(id, Utc::now());
            let dedup_id = job.dedup_id();
            assert!(dedup_id.is_some());

            assert!(!broker.is_pending(id).await.unwrap());
            broker.enqueue(job.clone(), dedup_id.clone()).await.unwrap();
            broker.enqueue(job.clone(), dedup_id).await.unwrap();
            broker.enqueue(job, None).await.unwrap();
            assert!(broker.is_pending(id).await.unwrap());

            let purged = broker
                .stream
                .purge()
                .filter(NatsBroker::job_subject(id))
                .await
                .unwrap();
            assert_eq!(purged.purged, 2);
            assert!(!broker.is_pending(id).await.unwrap());
        }
    }
}
