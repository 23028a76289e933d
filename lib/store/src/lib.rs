//! Persistence for the timetable synchronization engine.
//!
//! This crate provides:
//!
//! - **Data model**: schedule entities, sealed credentials, events, access grants
//! - **`TimetableStore`**: the persistence seam used by the sync engine
//! - **Implementations**: PostgreSQL via sqlx, and an in-memory store

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use model::{
    AccessGrant, Bearer, CredentialRecord, Event, FetchedEvent, MIN_SYNC_INTERVAL_MINUTES,
    ParseBearerError, ScheduleEntity,
};
pub use postgres::PgTimetableStore;
pub use store::{EventRange, TimetableStore};
