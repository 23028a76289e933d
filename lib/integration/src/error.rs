//! Error types for the integration crate.
//!
//! - `VaultError`: sealing and opening credential payloads
//! - `ProviderError`: failures reported by a timetable provider
//! - `RegistryError`: building and querying the provider registry

use std::fmt;

/// Errors from the credential vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// The configured key is not exactly 32 bytes.
    InvalidKeyLength { actual: usize },
    /// The ciphertext or IV is not in the `<hex>:<hex>` + hex IV format.
    MalformedCiphertext { reason: String },
    /// The authentication tag did not verify.
    AuthenticationFailed,
    /// Encryption failed.
    EncryptionFailed { reason: String },
    /// The plaintext is not a valid credential payload.
    MalformedPayload { reason: String },
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKeyLength { actual } => {
                write!(f, "vault key must be exactly 32 bytes, got {actual}")
            }
            Self::MalformedCiphertext { reason } => {
                write!(f, "malformed ciphertext: {reason}")
            }
            Self::AuthenticationFailed => write!(f, "ciphertext authentication failed"),
            Self::EncryptionFailed { reason } => write!(f, "encryption failed: {reason}"),
            Self::MalformedPayload { reason } => {
                write!(f, "malformed credential payload: {reason}")
            }
        }
    }
}

impl std::error::Error for VaultError {}

/// Errors from provider operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The portal rejected the credentials.
    InvalidCredentials { reason: String },
    /// The portal or scraper could not be reached.
    Unavailable { reason: String },
    /// The response could not be understood.
    ProtocolError { reason: String },
    /// No response within the allotted time.
    Timeout,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials { reason } => {
                write!(f, "invalid credentials: {reason}")
            }
            Self::Unavailable { reason } => write!(f, "provider unavailable: {reason}"),
            Self::ProtocolError { reason } => write!(f, "protocol error: {reason}"),
            Self::Timeout => write!(f, "provider timed out"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Errors from the provider registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No provider is registered under this id.
    UnknownProvider { provider_id: String },
    /// Two providers were registered under the same id.
    DuplicateProvider { provider_id: String },
    /// A configured provider endpoint is unusable.
    InvalidEndpoint { provider_id: String, reason: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProvider { provider_id } => {
                write!(f, "unknown provider: {provider_id}")
            }
            Self::DuplicateProvider { provider_id } => {
                write!(f, "provider registered twice: {provider_id}")
            }
            Self::InvalidEndpoint {
                provider_id,
                reason,
            } => write!(f, "invalid endpoint for provider '{provider_id}': {reason}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_display() {
        let err = VaultError::InvalidKeyLength { actual: 12 };
        assert!(err.to_string().contains("32 bytes"));
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn provider_error_display() {
        let err = ProviderError::Unavailable {
            reason: "503".to_string(),
        };
        assert!(err.to_string().contains("unavailable"));
        assert!(err.to_string().contains("503"));
        assert_eq!(ProviderError::Timeout.to_string(), "provider timed out");
    }

    #[test]
    fn unknown_provider_display() {
        let err = RegistryError::UnknownProvider {
            provider_id: "ecole-directe".to_string(),
        };
        assert!(err.to_string().contains("ecole-directe"));
    }
}
