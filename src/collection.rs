// Collection orchestration
//
// Runs metric collection for one resource, or for every resource of a
// provider with bounded concurrency. Each resource succeeds or fails on its
// own: a failed resource is recorded on its RunStatus and left out of the
// returned batches.

use dashmap::DashMap;
use futures_util::future;
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryOrchestrator;
use crate::error::BridgeError;
use crate::model::{MetricBatch, Resource};
use crate::provider::{catch_panic, CloudProvider, ProviderError, ProviderRegistry};
use crate::sink::{PushOutcome, Reconciler, SinkError};
use crate::status::{RunStatusTracker, RunTicket};

/// Whether a run was requested by a caller or fired by a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Always runs; the outcome is returned, not pushed
    OnDemand,
    /// Skips a resource already being collected; pushes what it collects
    Scheduled,
}

pub struct CollectionOrchestrator {
    registry: Arc<ProviderRegistry>,
    discovery: Arc<DiscoveryOrchestrator>,
    statuses: Arc<RunStatusTracker>,
    reconciler: Arc<Reconciler>,

    /// Explicit resource ID -> provider ID bindings
    resource_providers: DashMap<String, String>,

    /// Upper bound on concurrent provider calls within one `collect_all`
    max_concurrent: usize,
}

impl CollectionOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        discovery: Arc<DiscoveryOrchestrator>,
        statuses: Arc<RunStatusTracker>,
        reconciler: Arc<Reconciler>,
        max_concurrent: usize,
    ) -> Self {
        CollectionOrchestrator {
            registry,
            discovery,
            statuses,
            reconciler,
            resource_providers: DashMap::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn statuses(&self) -> &Arc<RunStatusTracker> {
        &self.statuses
    }

    /// Pins a resource to a provider, overriding its `providerId` property
    pub fn bind_provider(&self, resource_id: &str, provider_id: &str) {
        self.resource_providers
            .insert(resource_id.to_string(), provider_id.to_string());
    }

    pub fn unbind_provider(&self, resource_id: &str) -> Option<String> {
        self.resource_providers
            .remove(resource_id)
            .map(|(_, provider_id)| provider_id)
    }

    /// Provider responsible for `resource`
    ///
    /// An explicit binding wins; otherwise the resource's own `providerId`
    /// back-reference is used.
    ///
    /// # Errors
    /// * `BridgeError::Configuration` - no mapping, or the mapped provider is not registered
    pub fn resolve_provider(&self, resource: &Resource) -> Result<Arc<dyn CloudProvider>, BridgeError> {
        let provider_id = self
            .resource_providers
            .get(&resource.id)
            .map(|entry| entry.value().clone())
            .or_else(|| resource.provider_id().map(str::to_string))
            .ok_or_else(|| {
                BridgeError::config(format!("No provider mapping for resource '{}'", resource.id))
            })?;

        self.registry.require(&provider_id)
    }

    /// Collects one resource from its resolved provider
    pub async fn collect(&self, resource: &Resource) -> Result<MetricBatch, BridgeError> {
        let provider = self.resolve_provider(resource)?;
        Ok(self.collect_from(provider.as_ref(), resource).await?)
    }

    /// Spawns `collect` on the runtime; the handle resolves once the provider
    /// call and the status update are done
    pub fn collect_async(self: &Arc<Self>, resource: Resource) -> JoinHandle<Result<MetricBatch, BridgeError>> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.collect(&resource).await })
    }

    /// Collects one resource from a given provider, regardless of any run in flight
    pub async fn collect_from(
        &self,
        provider: &dyn CloudProvider,
        resource: &Resource,
    ) -> Result<MetricBatch, ProviderError> {
        let ticket = self
            .statuses
            .begin(&resource.id, &resource.resource_type, provider.provider_id());
        self.execute(provider, resource, ticket).await
    }

    async fn execute(
        &self,
        provider: &dyn CloudProvider,
        resource: &Resource,
        ticket: RunTicket,
    ) -> Result<MetricBatch, ProviderError> {
        debug!(
            "Collecting metrics for '{}' from provider '{}'",
            resource.id,
            provider.provider_id()
        );

        let run = self.statuses.guard(ticket);

        match catch_panic(provider.provider_id(), provider.collect(resource)).await {
            Ok(batch) => {
                run.complete(batch.len());
                debug!("Collected {} metric(s) for '{}'", batch.len(), resource.id);
                Ok(batch)
            }
            Err(e) => {
                run.fail(e.message.clone());
                warn!("Collection for '{}' failed: {}", resource.id, e);
                Err(e)
            }
        }
    }

    /// Collects every resource the provider reports
    ///
    /// Resources come from the discovery read-through cache. The returned
    /// batches hold the successful subset, ordered by resource ID.
    pub async fn collect_all(&self, provider_id: &str) -> Result<Vec<MetricBatch>, BridgeError> {
        let provider = self.registry.require(provider_id)?;
        let resources = self.discovery.discover_resources_for(provider.as_ref()).await?;

        let batches = self
            .collect_many(provider.as_ref(), &resources, RunMode::OnDemand)
            .await;

        info!(
            "Collected {}/{} resource(s) for provider '{}'",
            batches.len(),
            resources.len(),
            provider_id
        );
        Ok(batches)
    }

    /// Scheduled variant of `collect_all`: resources still being collected
    /// are skipped and every new batch is pushed downstream
    pub async fn collect_all_and_push(&self, provider_id: &str) -> Result<Vec<MetricBatch>, BridgeError> {
        let provider = self.registry.require(provider_id)?;
        let resources = self.discovery.discover_resources_for(provider.as_ref()).await?;

        let batches = self
            .collect_many(provider.as_ref(), &resources, RunMode::Scheduled)
            .await;

        info!(
            "Scheduled collection for provider '{}': {}/{} resource(s)",
            provider_id,
            batches.len(),
            resources.len()
        );
        Ok(batches)
    }

    async fn collect_many(
        &self,
        provider: &dyn CloudProvider,
        resources: &HashSet<Resource>,
        mode: RunMode,
    ) -> Vec<MetricBatch> {
        let mut ordered: Vec<Resource> = resources.iter().cloned().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let mut batches: Vec<MetricBatch> = stream::iter(ordered)
            .map(move |resource| async move { self.collect_one(provider, &resource, mode).await })
            .buffer_unordered(self.max_concurrent)
            .filter_map(future::ready)
            .collect()
            .await;

        batches.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        batches
    }

    /// One resource's run; `None` when it failed or was skipped
    async fn collect_one(
        &self,
        provider: &dyn CloudProvider,
        resource: &Resource,
        mode: RunMode,
    ) -> Option<MetricBatch> {
        match mode {
            RunMode::OnDemand => self.collect_from(provider, resource).await.ok(),
            RunMode::Scheduled => {
                let Some(ticket) = self.statuses.try_begin(
                    &resource.id,
                    &resource.resource_type,
                    provider.provider_id(),
                ) else {
                    debug!(
                        "Skipping scheduled collection for '{}': previous run still in progress",
                        resource.id
                    );
                    return None;
                };

                let batch = self.execute(provider, resource, ticket).await.ok()?;
                self.push_logged(provider, &batch).await;
                Some(batch)
            }
        }
    }

    /// Scheduled tick for one resource
    ///
    /// Skips the cycle if the resource is still being collected. Never
    /// returns an error: failures are recorded and logged.
    pub async fn run_scheduled(&self, resource: &Resource) {
        match self.resolve_provider(resource) {
            Ok(provider) => {
                self.collect_one(provider.as_ref(), resource, RunMode::Scheduled)
                    .await;
            }
            Err(e) => warn!("Scheduled collection for '{}' skipped: {}", resource.id, e),
        }
    }

    /// Submits a batch to the node provisioned for its resource
    pub async fn push_downstream(
        &self,
        provider: &dyn CloudProvider,
        batch: &MetricBatch,
    ) -> Result<PushOutcome, SinkError> {
        self.reconciler
            .push_metrics(provider.provider_type(), provider.provider_id(), batch)
            .await
    }

    async fn push_logged(&self, provider: &dyn CloudProvider, batch: &MetricBatch) {
        if let Err(e) = self.push_downstream(provider, batch).await {
            warn!(
                "Metric push for '{}' failed: {}",
                batch.resource_id, e
            );
        }
    }
}
