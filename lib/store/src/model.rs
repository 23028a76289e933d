//! Data model of the synchronization engine.

use chrono::{DateTime, Utc};
use classync_core::{EventId, ScheduleId, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Smallest sync interval a schedule may be registered with.
pub const MIN_SYNC_INTERVAL_MINUTES: u32 = 15;

/// One user's link to one provider, optionally scoped to an organization.
///
/// At most one schedule exists per (user, provider, organization).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntity {
    /// Schedule id.
    pub id: ScheduleId,
    /// The owning user.
    pub user_id: UserId,
    /// Provider registry key (e.g. "pronote").
    pub provider_id: String,
    /// School or sub-organization on the provider, if any.
    pub organization_id: Option<String>,
    /// Minutes between recurring syncs.
    pub sync_interval_minutes: u32,
    /// Last successful sync. `None` until the first one completes.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// When the schedule was created.
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntity {
    /// Creates a schedule that has never been synced.
    #[must_use]
    pub fn new(
        user_id: UserId,
        provider_id: impl Into<String>,
        organization_id: Option<String>,
        sync_interval_minutes: u32,
    ) -> Self {
        Self {
            id: ScheduleId::new(),
            user_id,
            provider_id: provider_id.into(),
            organization_id,
            sync_interval_minutes,
            last_synced_at: None,
            created_at: Utc::now(),
        }
    }

    /// Returns whether this schedule occupies the same uniqueness slot as `other`.
    #[must_use]
    pub fn same_slot(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.provider_id == other.provider_id
            && self.organization_id == other.organization_id
    }
}

/// Sealed provider credentials of a schedule.
///
/// `ciphertext` is `<hex-ciphertext>:<hex-auth-tag>`, `iv` is hex.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// The schedule these credentials belong to.
    pub schedule_id: ScheduleId,
    /// Hex ciphertext and auth tag.
    pub ciphertext: String,
    /// Hex initialization vector.
    pub iv: String,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("schedule_id", &self.schedule_id)
            .field("ciphertext", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .finish()
    }
}

/// An event as returned by a provider, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedEvent {
    /// Provider-assigned stable hash, if the provider has one.
    #[serde(default)]
    pub hash: Option<String>,
    /// Course subject or title.
    pub subject: String,
    /// Start of the course.
    pub start: DateTime<Utc>,
    /// End of the course.
    pub end: DateTime<Utc>,
    /// Room or place.
    #[serde(default)]
    pub location: Option<String>,
    /// Instructor name.
    #[serde(default)]
    pub teacher: Option<String>,
    /// Display color as provided.
    #[serde(default)]
    pub color: Option<String>,
}

impl FetchedEvent {
    /// Creates an event with only the required fields.
    #[must_use]
    pub fn new(subject: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            hash: None,
            subject: subject.into(),
            start,
            end,
            location: None,
            teacher: None,
            color: None,
        }
    }

    /// Sets the location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Sets the teacher.
    #[must_use]
    pub fn with_teacher(mut self, teacher: impl Into<String>) -> Self {
        self.teacher = Some(teacher.into());
        self
    }

    /// Sets the provider hash.
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Hash over the event's content, used when the provider supplies none.
    ///
    /// Identical provider output yields identical hashes across syncs.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.start.timestamp_millis().to_be_bytes());
        hasher.update(self.end.timestamp_millis().to_be_bytes());
        for part in [&self.location, &self.teacher] {
            hasher.update([0u8]);
            if let Some(value) = part {
                hasher.update(value.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// A stored course of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Row id.
    pub id: EventId,
    /// Owning schedule.
    pub schedule_id: ScheduleId,
    /// Provider hash, or the generated content hash.
    pub hash: String,
    /// Course subject or title.
    pub subject: String,
    /// Start of the course.
    pub starts_at: DateTime<Utc>,
    /// End of the course.
    pub ends_at: DateTime<Utc>,
    /// Room or place.
    pub location: Option<String>,
    /// Instructor name.
    pub teacher: Option<String>,
    /// Display color.
    pub color: Option<String>,
}

impl Event {
    /// Converts a fetched event into a row of `schedule_id`.
    #[must_use]
    pub fn from_fetched(schedule_id: ScheduleId, fetched: FetchedEvent) -> Self {
        let hash = match fetched.hash.as_deref() {
            Some(hash) if !hash.is_empty() => hash.to_string(),
            _ => fetched.content_hash(),
        };
        Self {
            id: EventId::new(),
            schedule_id,
            hash,
            subject: fetched.subject,
            starts_at: fetched.start,
            ends_at: fetched.end,
            location: fetched.location,
            teacher: fetched.teacher,
            color: fetched.color,
        }
    }
}

/// Holder of an externally issued credential reading schedules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Bearer {
    /// A third-party OAuth client acting under a user grant.
    OauthClient { client_id: String },
    /// A user-issued API key.
    ApiKey { key_id: String },
}

impl Bearer {
    /// Short kind tag used in storage.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OauthClient { .. } => "oauth",
            Self::ApiKey { .. } => "key",
        }
    }

    /// The client or key identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::OauthClient { client_id } => client_id,
            Self::ApiKey { key_id } => key_id,
        }
    }
}

impl fmt::Display for Bearer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Error returned when a bearer identity string is not `oauth:<id>` or `key:<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseBearerError {
    /// The rejected input.
    pub input: String,
}

impl fmt::Display for ParseBearerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bearer identity '{}'", self.input)
    }
}

impl std::error::Error for ParseBearerError {}

impl FromStr for Bearer {
    type Err = ParseBearerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseBearerError {
            input: s.to_string(),
        };
        let (kind, id) = s.split_once(':').ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }
        match kind {
            "oauth" => Ok(Self::OauthClient {
                client_id: id.to_string(),
            }),
            "key" => Ok(Self::ApiKey {
                key_id: id.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

/// Permission for a bearer to read one schedule of one user.
///
/// Grants are maintained by the authorization system; the engine only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    /// Who holds the grant.
    pub bearer: Bearer,
    /// The user who issued it.
    pub user_id: UserId,
    /// The schedule it covers.
    pub schedule_id: ScheduleId,
}
