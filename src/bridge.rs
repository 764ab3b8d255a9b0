// Bridge - the scheduling core
//
// Owns the provider registry, the run status trackers, both orchestrators
// and every timer. Exposes the operations the outer layers call: per-entity
// schedules, on-demand discovery and collection, status queries, and the
// global discovery/collection schedules.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ResultCache;
use crate::collection::CollectionOrchestrator;
use crate::config::{
    BridgeSettings, ConfigError, ScheduleConfig, ScheduleUpdate, DEFAULT_COLLECTION_SCHEDULE,
    DEFAULT_DISCOVERY_SCHEDULE,
};
use crate::discovery::DiscoveryOrchestrator;
use crate::error::BridgeError;
use crate::model::{EntityKind, MetricBatch, Resource, RunStatus, ValidationResult};
use crate::provider::{CloudProvider, ProviderRegistry};
use crate::scheduler::{tick_fn, Scheduler, TickFn};
use crate::sink::{MonitoringSink, Reconciler};
use crate::status::RunStatusTracker;

/// Entity ID of the timer that discovers every provider
pub const GLOBAL_DISCOVERY_JOB: &str = "global-discovery";

/// Entity ID of the timer that collects every provider's resources
pub const GLOBAL_COLLECTION_JOB: &str = "global-collection";

const NEVER: i64 = i64::MIN;

/// Global schedules and fan-out limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
    pub discovery: ScheduleConfig,
    pub collection: ScheduleConfig,
    pub max_concurrent_collections: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            discovery: DEFAULT_DISCOVERY_SCHEDULE,
            collection: DEFAULT_COLLECTION_SCHEDULE,
            max_concurrent_collections: 8,
        }
    }
}

impl BridgeOptions {
    pub fn from_settings(settings: &BridgeSettings) -> Result<Self, ConfigError> {
        Ok(BridgeOptions {
            discovery: settings.scheduler.discovery_schedule()?,
            collection: settings.scheduler.collection_schedule()?,
            max_concurrent_collections: settings.max_concurrent_collections,
        })
    }
}

/// State of the global collection schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalScheduleInfo {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}

pub struct Bridge {
    registry: Arc<ProviderRegistry>,
    discovery: Arc<DiscoveryOrchestrator>,
    collection: Arc<CollectionOrchestrator>,

    discovery_timers: Scheduler,
    collection_timers: Scheduler,
    global_timers: Scheduler,

    global_discovery: Mutex<ScheduleConfig>,
    global_collection: Mutex<ScheduleConfig>,
    last_collection_run: Arc<AtomicI64>,
    started: AtomicBool,
}

impl Bridge {
    pub fn new(registry: Arc<ProviderRegistry>, sink: Arc<dyn MonitoringSink>, options: BridgeOptions) -> Self {
        Self::with_reconciler(registry, Arc::new(Reconciler::new(sink)), options)
    }

    pub fn with_reconciler(
        registry: Arc<ProviderRegistry>,
        reconciler: Arc<Reconciler>,
        options: BridgeOptions,
    ) -> Self {
        let discovery = Arc::new(DiscoveryOrchestrator::new(
            Arc::clone(&registry),
            Arc::new(ResultCache::new()),
            Arc::new(RunStatusTracker::new(EntityKind::Discovery)),
            Arc::clone(&reconciler),
        ));

        let collection = Arc::new(CollectionOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&discovery),
            Arc::new(RunStatusTracker::new(EntityKind::Collection)),
            reconciler,
            options.max_concurrent_collections,
        ));

        Bridge {
            registry,
            discovery,
            collection,
            discovery_timers: Scheduler::new("discovery"),
            collection_timers: Scheduler::new("collection"),
            global_timers: Scheduler::new("global"),
            global_discovery: Mutex::new(options.discovery),
            global_collection: Mutex::new(options.collection),
            last_collection_run: Arc::new(AtomicI64::new(NEVER)),
            started: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &Arc<DiscoveryOrchestrator> {
        &self.discovery
    }

    pub fn collection(&self) -> &Arc<CollectionOrchestrator> {
        &self.collection
    }

    // ---- Discovery ----

    /// Registers `provider` and (re)arms its discovery timer
    ///
    /// A disabled config stops any existing timer instead.
    pub fn schedule_discovery(
        &self,
        provider: Arc<dyn CloudProvider>,
        config: &ScheduleConfig,
    ) -> Result<(), BridgeError> {
        config.validate()?;

        let provider_id = provider.provider_id().to_string();
        let provider_type = provider.provider_type().to_string();
        self.registry.register(provider);

        if !config.enabled {
            info!("Discovery for provider '{}' is disabled", provider_id);
            self.stop_discovery(&provider_id);
            return Ok(());
        }

        let discovery = Arc::clone(&self.discovery);
        let job = provider_id.clone();
        let tick = tick_fn(move || {
            let discovery = Arc::clone(&discovery);
            let provider_id = job.clone();
            async move {
                discovery.statuses().record_tick(&provider_id);
                discovery.run_scheduled(&provider_id).await;
            }
        });

        self.discovery_timers
            .schedule(&provider_id, config.initial_delay, config.interval, tick)?;
        self.discovery.statuses().mark_scheduled(
            &provider_id,
            &provider_type,
            &provider_id,
            config.interval,
            after(config.initial_delay),
        );

        Ok(())
    }

    /// Stops the provider's discovery timer; false if it had none
    pub fn stop_discovery(&self, provider_id: &str) -> bool {
        let stopped = self.discovery_timers.stop(provider_id);
        self.discovery.statuses().mark_unscheduled(provider_id);
        stopped
    }

    /// Swaps in a reconfigured provider, but only once it validates
    ///
    /// On an invalid result or a validation error the registered provider
    /// keeps running untouched. After a swap the provider's cached resources
    /// are dropped, so the next read-through discovers with the new setup.
    /// Running timers resolve the provider by ID on each tick and use the new
    /// one from their next tick.
    pub async fn reconfigure_provider(
        &self,
        provider: Arc<dyn CloudProvider>,
    ) -> Result<ValidationResult, BridgeError> {
        let provider_id = provider.provider_id().to_string();
        self.registry.require(&provider_id)?;

        let result = self.registry.replace_validated(provider).await?;
        if result.is_valid() {
            self.discovery.cache().remove(&provider_id);
        }
        Ok(result)
    }

    /// Cached resources for a provider, discovering on a cache miss
    pub async fn discover_resources(&self, provider_id: &str) -> Result<Arc<HashSet<Resource>>, BridgeError> {
        self.discovery.discover_resources(provider_id).await
    }

    pub fn discovery_status(&self) -> Vec<RunStatus> {
        self.discovery.statuses().snapshot()
    }

    // ---- Collection ----

    /// (Re)arms the collection timer for `resource`
    ///
    /// `provider_id`, when given, binds the resource to that provider.
    /// The provider must resolve before anything is scheduled.
    pub fn schedule_collection(
        &self,
        resource: Resource,
        config: &ScheduleConfig,
        provider_id: Option<&str>,
    ) -> Result<(), BridgeError> {
        config.validate()?;

        if let Some(provider_id) = provider_id {
            self.registry.require(provider_id)?;
            self.collection.bind_provider(&resource.id, provider_id);
        }
        let provider = self.collection.resolve_provider(&resource)?;

        if !config.enabled {
            info!("Collection for resource '{}' is disabled", resource.id);
            self.stop_collection(&resource.id);
            return Ok(());
        }

        let resource_id = resource.id.clone();
        let resource_type = resource.resource_type.clone();
        let resource = Arc::new(resource);
        let collection = Arc::clone(&self.collection);
        let tick = tick_fn(move || {
            let collection = Arc::clone(&collection);
            let resource = Arc::clone(&resource);
            async move {
                collection.statuses().record_tick(&resource.id);
                collection.run_scheduled(&resource).await;
            }
        });

        self.collection_timers
            .schedule(&resource_id, config.initial_delay, config.interval, tick)?;
        self.collection.statuses().mark_scheduled(
            &resource_id,
            &resource_type,
            provider.provider_id(),
            config.interval,
            after(config.initial_delay),
        );

        Ok(())
    }

    /// Stops the resource's collection timer; false if it had none
    ///
    /// Also releases any explicit provider binding made when it was scheduled.
    pub fn stop_collection(&self, resource_id: &str) -> bool {
        let stopped = self.collection_timers.stop(resource_id);
        self.collection.statuses().mark_unscheduled(resource_id);
        self.collection.unbind_provider(resource_id);
        stopped
    }

    /// Collects one resource in the background
    pub fn collect_metrics(&self, resource: Resource) -> JoinHandle<Result<MetricBatch, BridgeError>> {
        self.collection.collect_async(resource)
    }

    /// Collects one resource from an explicitly named provider
    pub async fn collect_metrics_from(
        &self,
        provider_id: &str,
        resource: &Resource,
    ) -> Result<MetricBatch, BridgeError> {
        let provider = self.registry.require(provider_id)?;
        Ok(self.collection.collect_from(provider.as_ref(), resource).await?)
    }

    pub async fn collect_all_metrics(&self, provider_id: &str) -> Result<Vec<MetricBatch>, BridgeError> {
        self.collection.collect_all(provider_id).await
    }

    pub fn collection_status(&self) -> Vec<RunStatus> {
        self.collection.statuses().snapshot()
    }

    // ---- Global schedules ----

    /// Arms the global discovery and collection timers that are enabled
    pub fn start(&self) -> Result<(), BridgeError> {
        let discovery = *lock(&self.global_discovery);
        if discovery.enabled {
            self.global_timers.schedule(
                GLOBAL_DISCOVERY_JOB,
                discovery.initial_delay,
                discovery.interval,
                self.global_discovery_tick(),
            )?;
        } else {
            info!("Global discovery is disabled");
        }

        let collection = *lock(&self.global_collection);
        if collection.enabled {
            self.arm_global_collection(&collection)?;
        } else {
            info!("Global collection is disabled");
        }

        self.started.store(true, Ordering::SeqCst);
        info!(
            "Bridge started with {} provider(s)",
            self.registry.len()
        );
        Ok(())
    }

    /// Discovers every provider that has no timer of its own
    fn global_discovery_tick(&self) -> TickFn {
        let registry = Arc::clone(&self.registry);
        let discovery = Arc::clone(&self.discovery);

        tick_fn(move || {
            let registry = Arc::clone(&registry);
            let discovery = Arc::clone(&discovery);
            async move {
                let provider_ids: Vec<String> = registry
                    .ids()
                    .into_iter()
                    .filter(|id| {
                        !discovery
                            .statuses()
                            .get(id)
                            .map(|status| status.scheduled)
                            .unwrap_or(false)
                    })
                    .collect();

                debug!("Global discovery over {} provider(s)", provider_ids.len());

                let handles: Vec<JoinHandle<()>> = provider_ids
                    .into_iter()
                    .map(|provider_id| {
                        let discovery = Arc::clone(&discovery);
                        tokio::spawn(async move { discovery.run_scheduled(&provider_id).await })
                    })
                    .collect();

                for handle in handles {
                    if let Err(e) = handle.await {
                        error!("Discovery task panicked: {}", e);
                    }
                }
            }
        })
    }

    /// Collects every provider's resources and pushes the batches
    fn global_collection_tick(&self) -> TickFn {
        let registry = Arc::clone(&self.registry);
        let collection = Arc::clone(&self.collection);
        let last_run = Arc::clone(&self.last_collection_run);

        tick_fn(move || {
            let registry = Arc::clone(&registry);
            let collection = Arc::clone(&collection);
            let last_run = Arc::clone(&last_run);
            async move {
                last_run.store(Utc::now().timestamp_millis(), Ordering::Relaxed);

                let handles: Vec<(String, JoinHandle<Result<Vec<MetricBatch>, BridgeError>>)> = registry
                    .ids()
                    .into_iter()
                    .map(|provider_id| {
                        let collection = Arc::clone(&collection);
                        let id = provider_id.clone();
                        let handle =
                            tokio::spawn(async move { collection.collect_all_and_push(&id).await });
                        (provider_id, handle)
                    })
                    .collect();

                for (provider_id, handle) in handles {
                    match handle.await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("Collection for provider '{}' failed: {}", provider_id, e),
                        Err(e) => error!("Collection task for '{}' panicked: {}", provider_id, e),
                    }
                }
            }
        })
    }

    fn arm_global_collection(&self, config: &ScheduleConfig) -> Result<(), BridgeError> {
        self.global_timers.schedule(
            GLOBAL_COLLECTION_JOB,
            config.initial_delay,
            config.interval,
            self.global_collection_tick(),
        )
    }

    pub fn schedule_info(&self) -> GlobalScheduleInfo {
        let config = *lock(&self.global_collection);
        let timer = self.global_timers.schedule_info(GLOBAL_COLLECTION_JOB);

        GlobalScheduleInfo {
            enabled: config.enabled,
            initial_delay: config.initial_delay,
            interval: config.interval,
            next_run: timer.and_then(|t| t.next_run),
            last_run: match self.last_collection_run.load(Ordering::Relaxed) {
                NEVER => None,
                millis => DateTime::from_timestamp_millis(millis),
            },
        }
    }

    /// Applies an untyped change to the global collection schedule
    ///
    /// The update is parsed and validated before anything is touched; on any
    /// failure the cause is logged, the previous schedule keeps running and
    /// `false` is returned.
    pub fn update_schedule(&self, update: &Value) -> bool {
        let update = match ScheduleUpdate::from_value(update) {
            Ok(update) => update,
            Err(e) => {
                error!("Rejected schedule update: {}", e);
                return false;
            }
        };

        let mut current = lock(&self.global_collection);
        let next = match update.apply_to(&current) {
            Ok(next) => next,
            Err(e) => {
                error!("Rejected schedule update: {}", e);
                return false;
            }
        };

        if self.started.load(Ordering::SeqCst) {
            self.global_timers.stop(GLOBAL_COLLECTION_JOB);

            if next.enabled {
                if let Err(e) = self.arm_global_collection(&next) {
                    error!("Failed to re-arm global collection: {}", e);
                    if current.enabled {
                        if let Err(e) = self.arm_global_collection(&current) {
                            error!("Failed to restore global collection: {}", e);
                        }
                    }
                    return false;
                }
            }
        }

        info!(
            "Global collection schedule updated: enabled={}, initial_delay={:?}, interval={:?}",
            next.enabled, next.initial_delay, next.interval
        );
        *current = next;
        true
    }

    // ---- Lifecycle ----

    /// One discovery + collection pass over every provider, pushing results
    ///
    /// Returns the number of metric batches collected.
    pub async fn run_once(&self) -> usize {
        let mut collected = 0;

        for provider in self.registry.all() {
            let provider_id = provider.provider_id();

            if let Err(e) = self.discovery.discover_and_push(provider.as_ref()).await {
                error!("Discovery for provider '{}' failed: {}", provider_id, e);
                continue;
            }

            match self.collection.collect_all_and_push(provider_id).await {
                Ok(batches) => collected += batches.len(),
                Err(e) => error!("Collection for provider '{}' failed: {}", provider_id, e),
            }
        }

        info!("One-time pass complete: {} batch(es) collected", collected);
        collected
    }

    /// Stops every timer; in-flight runs are left to finish
    pub fn shutdown(&self) -> usize {
        let mut stopped = 0;

        for provider_id in self.discovery_timers.scheduled_ids() {
            stopped += usize::from(self.stop_discovery(&provider_id));
        }
        for resource_id in self.collection_timers.scheduled_ids() {
            stopped += usize::from(self.stop_collection(&resource_id));
        }
        stopped += self.global_timers.stop_all();

        self.started.store(false, Ordering::SeqCst);
        info!("Bridge shut down, {} timer(s) stopped", stopped);
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunState;
    use crate::testing::{instance, RecordingSink, ScriptedProvider};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tokio::time::sleep;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn bridge_with(options: BridgeOptions) -> (Bridge, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let reconciler = Arc::new(Reconciler::new(sink.clone()).with_retry_policy(0, Duration::ZERO));
        let bridge = Bridge::with_reconciler(Arc::new(ProviderRegistry::new()), reconciler, options);
        (bridge, sink)
    }

    fn bridge() -> (Bridge, Arc<RecordingSink>) {
        bridge_with(BridgeOptions {
            discovery: ScheduleConfig::new(secs(0), secs(300)).disabled(),
            collection: ScheduleConfig::new(secs(60), secs(60)),
            max_concurrent_collections: 4,
        })
    }

    #[tokio::test]
    async fn test_end_to_end_discover_then_collect() {
        let (bridge, _) = bridge();
        let provider = Arc::new(ScriptedProvider::new("p1").discovers(&["i-1"]));
        bridge.registry().register(provider.clone());

        let resources = bridge.discover_resources("p1").await.unwrap();
        let resource = resources.iter().next().unwrap().clone();
        assert_eq!(resource.id, "i-1");
        assert_eq!(resource.resource_type, "EC2");
        assert_eq!(resource.status, "running");
        assert_eq!(resource.region, "us-east-1");

        let batch = bridge.collect_metrics_from("p1", &resource).await.unwrap();
        assert_eq!(batch.resource_id, "i-1");
        assert!(!batch.is_empty());

        let statuses = bridge.collection_status();
        let status = statuses.iter().find(|s| s.entity_id == "i-1").unwrap();
        assert_eq!(status.state, RunState::Completed);
        assert!(status.last_result_count >= 1);

        let discovery = bridge.discovery_status();
        assert_eq!(discovery[0].entity_id, "p1");
        assert_eq!(discovery[0].last_result_count, 1);
    }

    #[tokio::test]
    async fn test_collect_metrics_async() {
        let (bridge, _) = bridge();
        let provider = Arc::new(ScriptedProvider::new("p1"));
        bridge.registry().register(provider.clone());

        let batch = bridge
            .collect_metrics(provider.resource("i-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.resource_id, "i-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_discovery_keeps_one_timer() {
        let (bridge, _) = bridge();
        let provider = Arc::new(ScriptedProvider::new("p1").discovers(&["A"]));

        bridge
            .schedule_discovery(provider.clone(), &ScheduleConfig::new(secs(5), secs(5)))
            .unwrap();
        bridge
            .schedule_discovery(provider.clone(), &ScheduleConfig::new(secs(20), secs(20)))
            .unwrap();

        sleep(secs(21)).await;

        assert_eq!(provider.discover_calls.load(Ordering::SeqCst), 1);
        let status = &bridge.discovery_status()[0];
        assert!(status.scheduled);
        assert_eq!(status.schedule_interval, Some(secs(20)));
        assert_eq!(status.job_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_stop_unknown_is_noop() {
        let (bridge, _) = bridge();
        assert!(!bridge.stop_discovery("unknown-id"));
        assert!(!bridge.stop_collection("unknown-id"));
        assert!(bridge.discovery_status().is_empty());
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let (bridge, _) = bridge();
        let provider = Arc::new(ScriptedProvider::new("p1"));

        let err = bridge
            .schedule_discovery(provider, &ScheduleConfig::new(secs(0), secs(0)))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_schedule_collection_requires_provider() {
        let (bridge, _) = bridge();
        let orphan = Resource::new("i-9", "orphan", "EC2", "us-east-1");

        let err = bridge
            .schedule_collection(orphan.clone(), &ScheduleConfig::new(secs(1), secs(1)), None)
            .unwrap_err();
        assert!(err.is_configuration());

        let err = bridge
            .schedule_collection(orphan, &ScheduleConfig::new(secs(1), secs(1)), Some("p-missing"))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(bridge.collection_status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_collection_lifecycle() {
        let (bridge, _) = bridge();
        let provider = Arc::new(ScriptedProvider::new("p1"));
        bridge.registry().register(provider.clone());
        let resource = Resource::new("i-1", "web", "EC2", "us-east-1");

        bridge
            .schedule_collection(resource, &ScheduleConfig::new(secs(10), secs(10)), Some("p1"))
            .unwrap();

        let scheduled = bridge.collection_status()[0].clone();
        assert_eq!(scheduled.state, RunState::Scheduled);
        assert!(scheduled.next_scheduled_run.is_some());

        sleep(secs(25)).await;
        assert_eq!(provider.collect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.collection_status()[0].state, RunState::Completed);

        assert!(bridge.stop_collection("i-1"));
        let stopped = bridge.collection_status()[0].clone();
        assert!(!stopped.scheduled);
        assert_eq!(stopped.state, RunState::Completed);

        sleep(secs(30)).await;
        assert_eq!(provider.collect_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_collection_schedule_stops_timer() {
        let (bridge, _) = bridge();
        bridge.registry().register(Arc::new(ScriptedProvider::new("p1")));

        bridge
            .schedule_collection(instance("p1", "i-1"), &ScheduleConfig::new(secs(60), secs(60)), None)
            .unwrap();
        bridge
            .schedule_collection(
                instance("p1", "i-1"),
                &ScheduleConfig::new(secs(60), secs(60)).disabled(),
                None,
            )
            .unwrap();

        let status = bridge.collection_status()[0].clone();
        assert_eq!(status.state, RunState::Disabled);
        assert!(!status.scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_schedules_discover_push_and_collect() {
        let (bridge, sink) = bridge_with(BridgeOptions {
            discovery: ScheduleConfig::new(secs(0), secs(300)),
            collection: ScheduleConfig::new(secs(1), secs(60)),
            max_concurrent_collections: 4,
        });
        bridge
            .registry()
            .register(Arc::new(ScriptedProvider::new("p1").discovers(&["i-1", "i-2"])));

        bridge.start().unwrap();
        assert!(bridge.schedule_info().last_run.is_none());

        sleep(secs(2)).await;

        assert_eq!(sink.upserts(), vec![("cloud-aws-p1".to_string(), 2)]);
        assert_eq!(sink.submissions().len(), 2);

        let info = bridge.schedule_info();
        assert!(info.enabled);
        assert!(info.last_run.is_some());
        assert!(info.next_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_discovery_skips_individually_scheduled_providers() {
        let (bridge, _) = bridge_with(BridgeOptions {
            discovery: ScheduleConfig::new(secs(0), secs(300)),
            collection: ScheduleConfig::new(secs(60), secs(60)).disabled(),
            max_concurrent_collections: 4,
        });
        let own = Arc::new(ScriptedProvider::new("own").discovers(&["A"]));
        let shared = Arc::new(ScriptedProvider::new("shared").discovers(&["B"]));

        bridge
            .schedule_discovery(own.clone(), &ScheduleConfig::new(secs(100), secs(100)))
            .unwrap();
        bridge.registry().register(shared.clone());
        bridge.start().unwrap();

        sleep(secs(1)).await;

        assert_eq!(own.discover_calls.load(Ordering::SeqCst), 0);
        assert_eq!(shared.discover_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_schedule_rejects_bad_interval() {
        let (bridge, _) = bridge();
        bridge.start().unwrap();
        let before = bridge.schedule_info();

        assert!(!bridge.update_schedule(&json!({ "interval": "not-a-number" })));
        assert!(!bridge.update_schedule(&json!({ "interval": 0 })));
        assert!(!bridge.update_schedule(&json!("interval=5m")));

        assert_eq!(bridge.schedule_info(), before);
        assert!(bridge.global_timers.is_scheduled(GLOBAL_COLLECTION_JOB));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_schedule_applies_and_disables() {
        let (bridge, _) = bridge();
        bridge.start().unwrap();

        assert!(bridge.update_schedule(&json!({ "interval": "2m", "initialDelay": 5 })));
        let info = bridge.schedule_info();
        assert_eq!(info.interval, secs(120));
        assert_eq!(info.initial_delay, secs(5));
        assert_eq!(
            bridge.global_timers.schedule_info(GLOBAL_COLLECTION_JOB).unwrap().interval,
            secs(120)
        );

        assert!(bridge.update_schedule(&json!({ "enabled": false })));
        let info = bridge.schedule_info();
        assert!(!info.enabled);
        assert!(info.next_run.is_none());
        assert!(!bridge.global_timers.is_scheduled(GLOBAL_COLLECTION_JOB));

        assert!(bridge.update_schedule(&json!({ "enabled": true })));
        assert!(bridge.global_timers.is_scheduled(GLOBAL_COLLECTION_JOB));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_discovery_survives_panicking_provider() {
        let (bridge, _) = bridge();
        let provider = Arc::new(ScriptedProvider::new("p1").discovers(&["A"]));
        provider.panic_on_next_call();

        bridge
            .schedule_discovery(provider.clone(), &ScheduleConfig::new(secs(1), secs(10)))
            .unwrap();

        sleep(secs(2)).await;
        assert_eq!(bridge.discovery_status()[0].state, RunState::Failed);

        sleep(secs(10)).await;
        assert_eq!(provider.discover_calls.load(Ordering::SeqCst), 2);
        let status = &bridge.discovery_status()[0];
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.consecutive_failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_schedule_rejects_out_of_range_delay() {
        let (bridge, _) = bridge();
        bridge.start().unwrap();
        let before = bridge.schedule_info();

        assert!(!bridge.update_schedule(&json!({ "initialDelay": u64::MAX })));

        assert_eq!(bridge.schedule_info(), before);
        assert_eq!(
            bridge.global_timers.schedule_info(GLOBAL_COLLECTION_JOB).unwrap().initial_delay,
            secs(60)
        );
    }

    #[tokio::test]
    async fn test_out_of_range_schedule_is_configuration_error() {
        let (bridge, _) = bridge();
        let provider = Arc::new(ScriptedProvider::new("p1"));

        let err = bridge
            .schedule_discovery(provider.clone(), &ScheduleConfig::new(secs(u64::MAX), secs(60)))
            .unwrap_err();
        assert!(err.is_configuration());

        let err = bridge
            .schedule_collection(
                provider.resource("i-1"),
                &ScheduleConfig::new(secs(0), secs(u64::MAX)),
                None,
            )
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(bridge.discovery_timers.is_empty());
        assert!(bridge.collection_timers.is_empty());
    }

    #[tokio::test]
    async fn test_reconfigure_provider() {
        let (bridge, _) = bridge();
        bridge
            .registry()
            .register(Arc::new(ScriptedProvider::new("p1").discovers(&["A"])));
        bridge.discover_resources("p1").await.unwrap();

        let replacement = Arc::new(ScriptedProvider::new("p1").discovers(&["B"]));
        let result = bridge.reconfigure_provider(replacement.clone()).await.unwrap();
        assert!(result.is_valid());

        let resources = bridge.discover_resources("p1").await.unwrap();
        assert!(resources.iter().all(|r| r.id == "B"));
        assert_eq!(replacement.discover_calls.load(Ordering::SeqCst), 1);

        let rejected = Arc::new(ScriptedProvider::new("p1").rejects_validation());
        let result = bridge.reconfigure_provider(rejected.clone()).await.unwrap();
        assert!(!result.is_valid());

        let current = bridge.registry().require("p1").unwrap();
        bridge.discovery().run_discovery(current.as_ref()).await.unwrap();
        assert_eq!(replacement.discover_calls.load(Ordering::SeqCst), 2);
        assert_eq!(rejected.discover_calls.load(Ordering::SeqCst), 0);

        let err = bridge
            .reconfigure_provider(Arc::new(ScriptedProvider::new("p-missing")))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_stop_collection_releases_binding() {
        let (bridge, _) = bridge();
        bridge.registry().register(Arc::new(ScriptedProvider::new("p1")));
        let unowned = Resource::new("i-1", "web", "EC2", "us-east-1");

        bridge
            .schedule_collection(unowned.clone(), &ScheduleConfig::new(secs(60), secs(60)), Some("p1"))
            .unwrap();
        assert!(bridge.collection().resolve_provider(&unowned).is_ok());

        assert!(bridge.stop_collection("i-1"));
        assert!(bridge.collection().resolve_provider(&unowned).err().unwrap().is_configuration());
    }

    #[tokio::test]
    async fn test_run_once() {
        let (bridge, sink) = bridge();
        bridge
            .registry()
            .register(Arc::new(ScriptedProvider::new("p1").discovers(&["i-1", "i-2"])));
        bridge.registry().register(Arc::new(
            ScriptedProvider::new("p2").fails_discovery("no credentials"),
        ));

        assert_eq!(bridge.run_once().await, 2);
        assert_eq!(sink.submissions().len(), 2);

        let failed = bridge
            .discovery_status()
            .into_iter()
            .find(|s| s.entity_id == "p2")
            .unwrap();
        assert_eq!(failed.state, RunState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_every_timer() {
        let (bridge, _) = bridge();
        let provider = Arc::new(ScriptedProvider::new("p1"));

        bridge
            .schedule_discovery(provider.clone(), &ScheduleConfig::new(secs(10), secs(10)))
            .unwrap();
        bridge
            .schedule_collection(provider.resource("i-1"), &ScheduleConfig::new(secs(10), secs(10)), None)
            .unwrap();
        bridge.start().unwrap();

        assert_eq!(bridge.shutdown(), 3);

        sleep(secs(120)).await;
        assert_eq!(provider.discover_calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.collect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.discovery_status()[0].state, RunState::Disabled);
    }
}
