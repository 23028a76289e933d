//! Job scheduling for classync.
//!
//! This crate provides:
//!
//! - **Job scheduler**: one recurring registration per schedule, one-off
//!   triggers, and a disabled mode when no broker is reachable
//! - **Broker trait**: durable job queue plus recurring job table, with NATS
//!   JetStream and in-memory implementations
//! - **Recurring ticker**: turns due registrations into queued jobs
//! - **Sync locks**: per-schedule mutual exclusion, in-process or via NATS

pub mod broker;
pub mod envelope;
pub mod error;
pub mod job;
pub mod lock;
pub mod memory;
pub mod nats;
pub mod scheduler;
pub mod ticker;

pub use broker::{Broker, DUPLICATE_WINDOW, RecurringRegistration, RegisteredJob};
pub use envelope::{Envelope, EnvelopeError};
pub use error::{BrokerError, LockError, SchedulerError};
pub use job::{JobDisposition, JobHandler, JobTrigger, SyncJob, job_key};
pub use lock::{EntityLocks, LockLease, SyncLock};
pub use memory::{DeadLetter, MemoryBroker};
pub use nats::{ConsumerSettings, NatsBroker, NatsConfig, NatsConsumer, NatsSyncLock};
pub use scheduler::{Dispatch, JobScheduler};
pub use ticker::RecurringTicker;
