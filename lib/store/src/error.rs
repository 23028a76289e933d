//! Error types for the store crate.

use classync_core::ScheduleId;
use std::fmt;

/// Errors from persistence operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The schedule does not exist.
    NotFound { id: ScheduleId },
    /// A schedule already exists for this user, provider and organization.
    AlreadyExists {
        provider_id: String,
        organization_id: Option<String>,
    },
    /// A value is out of range for the backing storage.
    InvalidValue { field: &'static str, reason: String },
    /// A stored row could not be decoded.
    Decode { reason: String },
    /// Connecting to the database failed.
    ConnectionFailed { reason: String },
    /// The database rejected or failed the operation.
    Database { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "schedule not found: {id}"),
            Self::AlreadyExists {
                provider_id,
                organization_id,
            } => match organization_id {
                Some(org) => write!(
                    f,
                    "schedule already exists for provider '{provider_id}' and organization '{org}'"
                ),
                None => write!(f, "schedule already exists for provider '{provider_id}'"),
            },
            Self::InvalidValue { field, reason } => {
                write!(f, "invalid value for {field}: {reason}")
            }
            Self::Decode { reason } => write!(f, "failed to decode stored row: {reason}"),
            Self::ConnectionFailed { reason } => {
                write!(f, "database connection failed: {reason}")
            }
            Self::Database { reason } => write!(f, "database operation failed: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Decode(inner) => Self::Decode {
                reason: inner.to_string(),
            },
            other => Self::Database {
                reason: other.to_string(),
            },
        }
    }
}
