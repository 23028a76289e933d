//! Error types for the access crate.

use classync_store::{ParseBearerError, StoreError};
use std::fmt;

/// Errors from the access projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// The bearer identity is not `oauth:<client id>` or `key:<key id>`.
    InvalidIdentity { input: String },
    /// Storage failed.
    Storage { source: StoreError },
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdentity { input } => write!(f, "invalid bearer identity '{input}'"),
            Self::Storage { source } => write!(f, "storage error: {source}"),
        }
    }
}

impl std::error::Error for AccessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidIdentity { .. } => None,
            Self::Storage { source } => Some(source),
        }
    }
}

impl From<StoreError> for AccessError {
    fn from(source: StoreError) -> Self {
        Self::Storage { source }
    }
}

impl From<ParseBearerError> for AccessError {
    fn from(e: ParseBearerError) -> Self {
        Self::InvalidIdentity { input: e.input }
    }
}
