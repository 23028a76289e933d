//! Synchronization of provider timetables into storage.
//!
//! This crate provides:
//!
//! - **Sync executor**: one run per job, from credential decryption to event
//!   reconciliation
//! - **Job handler**: maps run outcomes onto broker dispositions
//! - **Timetable service**: registration and management of schedules for the
//!   API layer

pub mod error;
pub mod executor;
pub mod handler;
pub mod service;
pub mod window;

#[cfg(test)]
mod testing;

pub use error::{ServiceError, SyncError};
pub use executor::{DEFAULT_FETCH_TIMEOUT, SyncExecutor, SyncOutcome, SyncStage};
pub use handler::SyncJobHandler;
pub use service::{NewSchedule, SyncStatus, TimetableService};
pub use window::FetchWindow;
