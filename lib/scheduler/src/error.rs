//! Error types for the scheduler crate.
//!
//! - `BrokerError`: failures talking to the job broker
//! - `SchedulerError`: a scheduler operation that reached the broker and failed
//! - `LockError`: per-schedule mutual exclusion failures

use classync_core::ScheduleId;
use std::fmt;

/// Errors from broker operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connecting to the broker or setting up its resources failed.
    ConnectionFailed { reason: String },
    /// A job could not be enqueued.
    PublishFailed { reason: String },
    /// The recurring job table could not be read or written.
    RegistryFailed { reason: String },
    /// A stored job or registration could not be decoded.
    DecodeFailed { reason: String },
    /// The broker is temporarily refusing requests.
    Unavailable,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { reason } => write!(f, "broker connection failed: {reason}"),
            Self::PublishFailed { reason } => write!(f, "failed to enqueue job: {reason}"),
            Self::RegistryFailed { reason } => {
                write!(f, "recurring job table operation failed: {reason}")
            }
            Self::DecodeFailed { reason } => write!(f, "failed to decode job data: {reason}"),
            Self::Unavailable => write!(f, "broker unavailable"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Errors from scheduler operations on an active broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The broker failed while handling `operation` for a schedule.
    Broker {
        operation: &'static str,
        schedule_id: ScheduleId,
        source: BrokerError,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broker {
                operation,
                schedule_id,
                source,
            } => write!(f, "{operation} failed for {schedule_id}: {source}"),
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Broker { source, .. } => Some(source),
        }
    }
}

/// Errors from sync locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another run held the lock for the whole wait.
    Unavailable { schedule_id: ScheduleId },
    /// The lock backend failed.
    Backend { reason: String },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { schedule_id } => {
                write!(f, "sync lock for {schedule_id} is held by another run")
            }
            Self::Backend { reason } => write!(f, "sync lock backend failed: {reason}"),
        }
    }
}

impl std::error::Error for LockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_error_names_operation() {
        let id = ScheduleId::new();
        let err = SchedulerError::Broker {
            operation: "schedule_recurring",
            schedule_id: id,
            source: BrokerError::Unavailable,
        };
        let msg = err.to_string();
        assert!(msg.contains("schedule_recurring"));
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("broker unavailable"));
    }

    #[test]
    fn lock_error_display() {
        let id = ScheduleId::new();
        let err = LockError::Unavailable { schedule_id: id };
        assert!(err.to_string().contains("held by another run"));
    }
}
