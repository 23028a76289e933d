//! Provider integration for classync.
//!
//! This crate provides:
//!
//! - **Provider trait**: Common interface for school portal integrations
//! - **Provider registry**: Startup-time lookup from provider id to provider
//! - **Credential vault**: AES-256-GCM sealing of portal credentials
//! - **Adapters**: an HTTP scraper adapter and a scripted fixture

pub mod error;
pub mod fixture;
pub mod http;
pub mod provider;
pub mod registry;
pub mod vault;

pub use error::{ProviderError, RegistryError, VaultError};
pub use fixture::{FetchCall, FixtureProvider};
pub use http::HttpProvider;
pub use provider::{Provider, ProviderInfo, RawCredentials};
pub use registry::{ProviderRegistry, ProviderRegistryBuilder};
pub use vault::{CredentialVault, SealedSecret};
