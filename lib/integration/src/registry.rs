//! Startup-time provider registry.

use crate::error::RegistryError;
use crate::provider::{Provider, ProviderInfo};
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only table from provider id to provider.
///
/// Built once at startup with [`ProviderRegistry::builder`]; there is no way
/// to add or remove providers afterwards.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<HashMap<String, Arc<dyn Provider>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.providers.keys().collect();
        ids.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &ids)
            .finish()
    }
}

impl ProviderRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Looks up a provider.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownProvider`] if nothing is registered
    /// under `provider_id`.
    pub fn resolve(&self, provider_id: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProvider {
                provider_id: provider_id.to_string(),
            })
    }

    /// Returns whether a provider is registered under `provider_id`.
    #[must_use]
    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    /// Lists the registered providers sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> = self.providers.values().map(|p| p.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns whether no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Builder for [`ProviderRegistry`].
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    providers: HashMap<String, Arc<dyn Provider>>,
    duplicate: Option<String>,
}

impl ProviderRegistryBuilder {
    /// Adds a provider under its own id.
    #[must_use]
    pub fn register(mut self, provider: Arc<dyn Provider>) -> Self {
        let id = provider.id();
        if self.providers.contains_key(&id) {
            self.duplicate.get_or_insert(id);
        } else {
            self.providers.insert(id, provider);
        }
        self
    }

    /// Finishes the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateProvider`] if two providers share an id.
    pub fn build(self) -> Result<ProviderRegistry, RegistryError> {
        if let Some(provider_id) = self.duplicate {
            return Err(RegistryError::DuplicateProvider { provider_id });
        }
        Ok(ProviderRegistry {
            providers: Arc::new(self.providers),
        })
    }
}
