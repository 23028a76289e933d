//! Provider trait and related types.
//!
//! Every school portal integration implements [`Provider`], giving the sync
//! engine a uniform way to validate credentials and fetch a schedule window.

use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classync_store::FetchedEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Information about a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Registry key, e.g. `"pronote"`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
}

impl ProviderInfo {
    /// Creates provider info.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Decrypted portal credentials, opaque to everything but the provider.
///
/// The shape is provider specific, so it is kept as JSON. `Debug` never
/// prints the contents.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawCredentials(JsonValue);

impl RawCredentials {
    /// Wraps a credential payload.
    #[must_use]
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    /// Returns the payload.
    #[must_use]
    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    /// Gets a string field of an object payload.
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(JsonValue::as_str)
    }
}

impl fmt::Debug for RawCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawCredentials(<redacted>)")
    }
}

/// Trait for timetable providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns information about this provider.
    fn info(&self) -> ProviderInfo;

    /// Checks whether the portal accepts these credentials.
    ///
    /// `Ok(false)` means the portal answered and rejected them.
    ///
    /// # Errors
    ///
    /// Returns an error if the portal could not give an answer.
    async fn validate_credentials(
        &self,
        credentials: &RawCredentials,
    ) -> Result<bool, ProviderError>;

    /// Fetches the events between `from` and `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule could not be fetched.
    async fn get_schedule(
        &self,
        credentials: &RawCredentials,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FetchedEvent>, ProviderError>;

    /// Registry key of this provider.
    fn id(&self) -> String {
        self.info().id
    }
}
