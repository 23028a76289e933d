//! Versioned envelope for data persisted in the broker.
//!
//! Jobs and registrations outlive the process that wrote them, so every
//! message and KV value carries a version header.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned wrapper around a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the envelope format.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates an envelope with the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decodes an envelope written by this or an older version.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not an envelope of `T`, or were
    /// written by a newer version.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Invalid {
                reason: e.to_string(),
            })?;
        if envelope.version > CURRENT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                version: envelope.version,
            });
        }
        Ok(envelope)
    }
}

/// Errors decoding an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Not a valid envelope.
    Invalid { reason: String },
    /// Written by a newer version.
    UnsupportedVersion { version: u32 },
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { reason } => write!(f, "invalid envelope: {reason}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported envelope version {version}")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}
