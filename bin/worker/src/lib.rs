//! classync background worker.
//!
//! Consumes sync jobs from the broker, turns due recurring registrations
//! into jobs, and keeps registrations in step with stored schedules.

pub mod config;
pub mod error;
pub mod runtime;
