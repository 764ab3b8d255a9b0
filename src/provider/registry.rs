// Provider registry - configured providers keyed by provider ID

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::CloudProvider;
use crate::error::BridgeError;
use crate::model::ValidationResult;

/// Holds every configured `CloudProvider`, keyed by its provider ID
///
/// Shared between the scheduler ticks, the orchestrators and on-demand
/// callers; all operations are safe under concurrent access.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider, returning the one it replaced (if any)
    pub fn register(&self, provider: Arc<dyn CloudProvider>) -> Option<Arc<dyn CloudProvider>> {
        let id = provider.provider_id().to_string();
        info!("Registering provider '{}' ({})", id, provider.provider_type());
        self.providers.insert(id, provider)
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn CloudProvider>> {
        self.providers.get(provider_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Like `get`, but a missing provider is a configuration error
    pub fn require(&self, provider_id: &str) -> Result<Arc<dyn CloudProvider>, BridgeError> {
        self.get(provider_id)
            .ok_or_else(|| BridgeError::config(format!("Provider not found: {}", provider_id)))
    }

    pub fn remove(&self, provider_id: &str) -> Option<Arc<dyn CloudProvider>> {
        self.providers.remove(provider_id).map(|(_, provider)| provider)
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    /// Provider IDs in sorted order
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Every provider, sorted by ID
    pub fn all(&self) -> Vec<Arc<dyn CloudProvider>> {
        let mut providers: Vec<Arc<dyn CloudProvider>> =
            self.providers.iter().map(|e| Arc::clone(e.value())).collect();
        providers.sort_by(|a, b| a.provider_id().cmp(b.provider_id()));
        providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Swaps in a reconfigured provider only if it validates
    ///
    /// The candidate is validated before anything is touched. On an invalid
    /// result or a validation failure the currently registered provider
    /// stays in place, so there is nothing to roll back.
    ///
    /// # Returns
    /// * `Ok(result)` - validation ran; the candidate is installed iff `result.is_valid()`
    /// * `Err(BridgeError::Provider)` - validation itself failed; nothing changed
    pub async fn replace_validated(
        &self,
        candidate: Arc<dyn CloudProvider>,
    ) -> Result<ValidationResult, BridgeError> {
        let id = candidate.provider_id().to_string();

        let result = match candidate.validate().await {
            Ok(result) => result,
            Err(e) => {
                warn!("Validation of new configuration for '{}' failed: {}", id, e);
                return Err(e.into());
            }
        };

        if result.is_valid() {
            self.providers.insert(id.clone(), candidate);
            info!("Provider '{}' reconfigured", id);
        } else {
            warn!(
                "Rejected configuration for provider '{}': {}",
                id,
                result.message()
            );
        }

        Ok(result)
    }
}
