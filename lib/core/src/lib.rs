//! Core identifiers and utilities for classync.
//!
//! This crate provides the id types and the error `Result` alias shared by
//! every other crate of the timetable synchronization engine.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{EventId, ParseIdError, ScheduleId, UserId};
