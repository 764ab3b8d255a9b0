// Discovery orchestration
//
// Runs a discovery pass for one provider: call the provider, replace its
// cached resource set, record the outcome on its RunStatus and, for the
// scheduled path, push the resulting nodes downstream.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::ResultCache;
use crate::error::BridgeError;
use crate::model::{DiscoveredNode, Resource};
use crate::provider::{catch_panic, CloudProvider, ProviderError, ProviderRegistry};
use crate::sink::{Reconciler, SinkError};
use crate::status::{RunStatusTracker, RunTicket};

pub struct DiscoveryOrchestrator {
    registry: Arc<ProviderRegistry>,
    cache: Arc<ResultCache>,
    statuses: Arc<RunStatusTracker>,
    reconciler: Arc<Reconciler>,
}

impl DiscoveryOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Arc<ResultCache>,
        statuses: Arc<RunStatusTracker>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        DiscoveryOrchestrator {
            registry,
            cache,
            statuses,
            reconciler,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn statuses(&self) -> &Arc<RunStatusTracker> {
        &self.statuses
    }

    /// Runs discovery now, regardless of any run already in flight
    ///
    /// On success the provider's cache entry is overwritten with the new set.
    /// Failures are recorded on the provider's status and returned.
    pub async fn run_discovery(
        &self,
        provider: &dyn CloudProvider,
    ) -> Result<Arc<HashSet<Resource>>, ProviderError> {
        let ticket = self.statuses.begin(
            provider.provider_id(),
            provider.provider_type(),
            provider.provider_id(),
        );
        self.execute(provider, ticket).await
    }

    async fn execute(
        &self,
        provider: &dyn CloudProvider,
        ticket: RunTicket,
    ) -> Result<Arc<HashSet<Resource>>, ProviderError> {
        let provider_id = provider.provider_id();
        info!("Starting discovery for provider '{}'", provider_id);

        let run = self.statuses.guard(ticket);

        match catch_panic(provider_id, provider.discover()).await {
            Ok(resources) => {
                let count = resources.len();
                let resources = if run.complete(count) {
                    self.cache.replace(provider_id, resources)
                } else {
                    Arc::new(resources)
                };

                info!(
                    "Discovery for provider '{}' completed: {} resource(s)",
                    provider_id, count
                );
                Ok(resources)
            }
            Err(e) => {
                run.fail(e.message.clone());
                error!("Discovery for provider '{}' failed: {}", provider_id, e);
                Err(e)
            }
        }
    }

    /// Discovery followed by a best-effort downstream push
    ///
    /// A push failure is logged and never turns the discovery into a failure.
    pub async fn discover_and_push(
        &self,
        provider: &dyn CloudProvider,
    ) -> Result<Arc<HashSet<Resource>>, ProviderError> {
        let resources = self.run_discovery(provider).await?;
        self.push_logged(provider, &resources).await;
        Ok(resources)
    }

    /// Scheduled tick for one provider
    ///
    /// Skips the cycle if a discovery for the provider is still running.
    /// Never returns an error: failures are recorded and logged.
    pub async fn run_scheduled(&self, provider_id: &str) {
        let Some(provider) = self.registry.get(provider_id) else {
            warn!("Scheduled discovery for unknown provider '{}'", provider_id);
            return;
        };

        let Some(ticket) = self.statuses.try_begin(
            provider.provider_id(),
            provider.provider_type(),
            provider.provider_id(),
        ) else {
            debug!(
                "Skipping scheduled discovery for '{}': previous run still in progress",
                provider_id
            );
            return;
        };

        if let Ok(resources) = self.execute(provider.as_ref(), ticket).await {
            self.push_logged(provider.as_ref(), &resources).await;
        }
    }

    /// Read-through lookup of a provider's resources
    ///
    /// Serves the cached set when it is non-empty; otherwise discovers now
    /// and caches the result. There is no expiry.
    pub async fn discover_resources(
        &self,
        provider_id: &str,
    ) -> Result<Arc<HashSet<Resource>>, BridgeError> {
        let provider = self.registry.require(provider_id)?;
        Ok(self.discover_resources_for(provider.as_ref()).await?)
    }

    pub async fn discover_resources_for(
        &self,
        provider: &dyn CloudProvider,
    ) -> Result<Arc<HashSet<Resource>>, ProviderError> {
        if let Some(cached) = self.cache.get_non_empty(provider.provider_id()) {
            debug!(
                "Serving {} cached resource(s) for provider '{}'",
                cached.len(),
                provider.provider_id()
            );
            return Ok(cached);
        }

        self.run_discovery(provider).await
    }

    /// Upserts the provider's resources as nodes and synchronizes them
    pub async fn push_downstream(
        &self,
        provider: &dyn CloudProvider,
        resources: &HashSet<Resource>,
    ) -> Result<(), SinkError> {
        let nodes = Self::to_nodes(provider.provider_id(), resources);
        self.reconciler
            .push_nodes(provider.provider_type(), provider.provider_id(), &nodes)
            .await
    }

    async fn push_logged(&self, provider: &dyn CloudProvider, resources: &HashSet<Resource>) {
        if let Err(e) = self.push_downstream(provider, resources).await {
            warn!(
                "Downstream push for provider '{}' failed: {}",
                provider.provider_id(),
                e
            );
        }
    }

    /// Resources as monitoring nodes, ordered by ID
    pub fn to_nodes(provider_id: &str, resources: &HashSet<Resource>) -> Vec<DiscoveredNode> {
        let mut nodes: Vec<DiscoveredNode> = resources
            .iter()
            .map(|resource| DiscoveredNode::from_resource(resource, provider_id))
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}
