//! Error types for the sync crate.
//!
//! - `SyncError`: a sync run that could not complete
//! - `ServiceError`: a rejected or failed facade operation

use classync_core::ScheduleId;
use classync_integration::{ProviderError, RegistryError, VaultError};
use classync_scheduler::{LockError, SchedulerError};
use classync_store::StoreError;
use std::fmt;

/// Errors that end a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The schedule names a provider that is not registered.
    UnknownProvider { provider_id: String },
    /// The provider registry is misconfigured.
    ProviderConfig { source: RegistryError },
    /// The stored credentials could not be opened.
    DecryptionFailed {
        schedule_id: ScheduleId,
        source: VaultError,
    },
    /// The provider failed or timed out.
    ProviderFetchFailed {
        provider_id: String,
        source: ProviderError,
    },
    /// Storage failed.
    StorageFailure { source: StoreError },
    /// Another run kept the schedule's lock.
    LockUnavailable { source: LockError },
}

impl SyncError {
    /// Returns whether a later attempt may succeed.
    ///
    /// Configuration and security failures are not retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnknownProvider { .. }
            | Self::ProviderConfig { .. }
            | Self::DecryptionFailed { .. } => false,
            Self::ProviderFetchFailed { .. }
            | Self::StorageFailure { .. }
            | Self::LockUnavailable { .. } => true,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProvider { provider_id } => {
                write!(f, "unknown provider: {provider_id}")
            }
            Self::ProviderConfig { source } => write!(f, "provider configuration: {source}"),
            Self::DecryptionFailed {
                schedule_id,
                source,
            } => write!(f, "credentials of {schedule_id} could not be opened: {source}"),
            Self::ProviderFetchFailed {
                provider_id,
                source,
            } => write!(f, "provider '{provider_id}' fetch failed: {source}"),
            Self::StorageFailure { source } => write!(f, "storage failure: {source}"),
            Self::LockUnavailable { source } => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UnknownProvider { .. } => None,
            Self::ProviderConfig { source } => Some(source),
            Self::DecryptionFailed { source, .. } => Some(source),
            Self::ProviderFetchFailed { source, .. } => Some(source),
            Self::StorageFailure { source } => Some(source),
            Self::LockUnavailable { source } => Some(source),
        }
    }
}

impl From<RegistryError> for SyncError {
    fn from(source: RegistryError) -> Self {
        match source {
            RegistryError::UnknownProvider { provider_id } => Self::UnknownProvider { provider_id },
            source => Self::ProviderConfig { source },
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(source: StoreError) -> Self {
        Self::StorageFailure { source }
    }
}

/// Errors from [`crate::TimetableService`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The sync interval is below the minimum.
    IntervalTooShort { minutes: u32, minimum: u32 },
    /// No provider is registered under this id.
    UnknownProvider { provider_id: String },
    /// The provider registry is misconfigured.
    ProviderConfig { source: RegistryError },
    /// The provider rejected the credentials.
    InvalidCredentials { provider_id: String },
    /// The user already has a schedule for this provider and organization.
    AlreadyExists {
        provider_id: String,
        organization_id: Option<String>,
    },
    /// The schedule does not exist.
    NotFound { id: ScheduleId },
    /// The provider could not validate the credentials.
    Provider { source: ProviderError },
    /// The credentials could not be sealed or opened.
    Vault { source: VaultError },
    /// Storage failed.
    Storage { source: StoreError },
    /// The scheduler's broker failed.
    Scheduler { source: SchedulerError },
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntervalTooShort { minutes, minimum } => write!(
                f,
                "sync interval of {minutes} minutes is below the minimum of {minimum}"
            ),
            Self::UnknownProvider { provider_id } => {
                write!(f, "unknown provider: {provider_id}")
            }
            Self::ProviderConfig { source } => write!(f, "provider configuration: {source}"),
            Self::InvalidCredentials { provider_id } => {
                write!(f, "credentials rejected by provider '{provider_id}'")
            }
            Self::AlreadyExists {
                provider_id,
                organization_id,
            } => match organization_id {
                Some(org) => write!(
                    f,
                    "a schedule already exists for provider '{provider_id}' and organization '{org}'"
                ),
                None => write!(f, "a schedule already exists for provider '{provider_id}'"),
            },
            Self::NotFound { id } => write!(f, "schedule not found: {id}"),
            Self::Provider { source } => write!(f, "provider error: {source}"),
            Self::Vault { source } => write!(f, "vault error: {source}"),
            Self::Storage { source } => write!(f, "storage error: {source}"),
            Self::Scheduler { source } => write!(f, "scheduler error: {source}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(source: StoreError) -> Self {
        match source {
            StoreError::NotFound { id } => Self::NotFound { id },
            StoreError::AlreadyExists {
                provider_id,
                organization_id,
            } => Self::AlreadyExists {
                provider_id,
                organization_id,
            },
            source => Self::Storage { source },
        }
    }
}

impl From<RegistryError> for ServiceError {
    fn from(source: RegistryError) -> Self {
        match source {
            RegistryError::UnknownProvider { provider_id } => Self::UnknownProvider { provider_id },
            source => Self::ProviderConfig { source },
        }
    }
}

impl From<VaultError> for ServiceError {
    fn from(source: VaultError) -> Self {
        Self::Vault { source }
    }
}

impl From<SchedulerError> for ServiceError {
    fn from(source: SchedulerError) -> Self {
        Self::Scheduler { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(
            !SyncError::UnknownProvider {
                provider_id: "x".to_string()
            }
            .is_retryable()
        );
        assert!(
            !SyncError::DecryptionFailed {
                schedule_id: ScheduleId::new(),
                source: VaultError::AuthenticationFailed,
            }
            .is_retryable()
        );
        assert!(
            SyncError::ProviderFetchFailed {
                provider_id: "x".to_string(),
                source: ProviderError::Timeout,
            }
            .is_retryable()
        );
        assert!(
            SyncError::StorageFailure {
                source: StoreError::Database {
                    reason: "gone".to_string()
                }
            }
            .is_retryable()
        );
    }

    #[test]
    fn decryption_error_never_mentions_payload() {
        let err = SyncError::DecryptionFailed {
            schedule_id: ScheduleId::new(),
            source: VaultError::AuthenticationFailed,
        };
        assert!(err.to_string().contains("could not be opened"));
    }

    #[test]
    fn registry_errors_keep_their_cause() {
        let unknown = RegistryError::UnknownProvider {
            provider_id: "pronote".to_string(),
        };
        let endpoint = RegistryError::InvalidEndpoint {
            provider_id: "pronote".to_string(),
            reason: "not http".to_string(),
        };
        let duplicate = RegistryError::DuplicateProvider {
            provider_id: "pronote".to_string(),
        };

        assert_eq!(
            SyncError::from(unknown.clone()),
            SyncError::UnknownProvider {
                provider_id: "pronote".to_string()
            }
        );
        assert_eq!(
            SyncError::from(endpoint.clone()),
            SyncError::ProviderConfig {
                source: endpoint.clone()
            }
        );
        assert!(!SyncError::from(duplicate.clone()).is_retryable());
        assert!(SyncError::from(endpoint.clone()).to_string().contains("not http"));

        assert_eq!(
            ServiceError::from(unknown),
            ServiceError::UnknownProvider {
                provider_id: "pronote".to_string()
            }
        );
        assert_eq!(
            ServiceError::from(duplicate.clone()),
            ServiceError::ProviderConfig { source: duplicate }
        );
    }

    #[test]
    fn store_errors_map_to_service_errors() {
        let id = ScheduleId::new();
        assert_eq!(
            ServiceError::from(StoreError::NotFound { id }),
            ServiceError::NotFound { id }
        );
        assert!(matches!(
            ServiceError::from(StoreError::Database {
                reason: "x".to_string()
            }),
            ServiceError::Storage { .. }
        ));
    }
}
