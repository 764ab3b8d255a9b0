// Test doubles shared by the orchestrator and bridge tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::model::{DiscoveredNode, MetricBatch, Resource, ValidationResult};
use crate::provider::{CloudProvider, ProviderError};
use crate::sink::{MonitoringSink, SinkError};

pub const TEST_PROVIDER_TYPE: &str = "aws";

pub fn instance(provider_id: &str, id: &str) -> Resource {
    Resource::new(id, id, "EC2", "us-east-1")
        .with_status("running")
        .owned_by(provider_id, TEST_PROVIDER_TYPE)
}

/// Provider whose discovery results are scripted call by call
///
/// Once the script runs out the last entry keeps being returned.
pub struct ScriptedProvider {
    id: String,
    script: Mutex<VecDeque<Result<Vec<String>, String>>>,
    last: Mutex<Result<Vec<String>, String>>,
    failing: HashSet<String>,
    delay: Duration,
    panic_next: AtomicBool,
    valid: bool,
    pub discover_calls: AtomicUsize,
    pub collect_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        ScriptedProvider {
            id: id.to_string(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(Ok(Vec::new())),
            failing: HashSet::new(),
            delay: Duration::ZERO,
            panic_next: AtomicBool::new(false),
            valid: true,
            discover_calls: AtomicUsize::new(0),
            collect_calls: AtomicUsize::new(0),
        }
    }

    pub fn discovers(self, ids: &[&str]) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(ids.iter().map(|id| id.to_string()).collect()));
        self
    }

    pub fn fails_discovery(self, message: &str) -> Self {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
        self
    }

    pub fn failing_on(mut self, resource_id: &str) -> Self {
        self.failing.insert(resource_id.to_string());
        self
    }

    /// Every provider call sleeps this long first
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rejects_validation(mut self) -> Self {
        self.valid = false;
        self
    }

    /// The next provider call panics; later calls behave normally
    pub fn panic_on_next_call(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    fn maybe_panic(&self) {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("provider '{}' crashed", self.id);
        }
    }

    pub fn resource(&self, id: &str) -> Resource {
        instance(&self.id, id)
    }

    fn next_step(&self) -> Result<Vec<String>, String> {
        let mut last = self.last.lock().unwrap();
        if let Some(step) = self.script.lock().unwrap().pop_front() {
            *last = step;
        }
        last.clone()
    }
}

#[async_trait]
impl CloudProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> &str {
        TEST_PROVIDER_TYPE
    }

    async fn validate(&self) -> Result<ValidationResult, ProviderError> {
        if self.valid {
            Ok(ValidationResult::valid())
        } else {
            Ok(ValidationResult::invalid("credentials rejected"))
        }
    }

    async fn discover(&self) -> Result<HashSet<Resource>, ProviderError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_panic();
        let step = self.next_step();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match step {
            Ok(ids) => Ok(ids.iter().map(|id| self.resource(id)).collect()),
            Err(message) => Err(ProviderError::new(&self.id, message).with_code("AuthFailure")),
        }
    }

    async fn collect(&self, resource: &Resource) -> Result<MetricBatch, ProviderError> {
        self.collect_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_panic();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.contains(&resource.id) {
            return Err(ProviderError::new(&self.id, "collect failed")
                .with_resource(&resource.id)
                .with_code("InternalFailure"));
        }

        let mut batch = MetricBatch::new(&resource.id);
        batch.add_metric("CPUUtilization", 12.5);
        batch.add_metric("NetworkIn", 1024.0);
        Ok(batch)
    }
}

/// In-memory monitoring system
///
/// Upserted nodes are provisioned immediately with sequential node IDs.
#[derive(Default)]
pub struct RecordingSink {
    upserts: Mutex<Vec<(String, usize)>>,
    synchronized: Mutex<Vec<String>>,
    submissions: Mutex<Vec<(String, String)>>,
    nodes: Mutex<HashMap<(String, String), String>>,
    failures_left: AtomicU32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` sink calls fail
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn provision(&self, foreign_source: &str, foreign_id: &str, node_id: &str) {
        self.nodes.lock().unwrap().insert(
            (foreign_source.to_string(), foreign_id.to_string()),
            node_id.to_string(),
        );
    }

    /// (foreign source, node count) per upsert
    pub fn upserts(&self) -> Vec<(String, usize)> {
        self.upserts.lock().unwrap().clone()
    }

    pub fn synchronized(&self) -> Vec<String> {
        self.synchronized.lock().unwrap().clone()
    }

    /// (node ID, resource ID) per submitted batch
    pub fn submissions(&self) -> Vec<(String, String)> {
        self.submissions.lock().unwrap().clone()
    }

    fn check_failure(&self) -> Result<(), SinkError> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            Err(SinkError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MonitoringSink for RecordingSink {
    async fn upsert_nodes(&self, foreign_source: &str, nodes: &[DiscoveredNode]) -> Result<(), SinkError> {
        self.check_failure()?;

        let mut provisioned = self.nodes.lock().unwrap();
        for node in nodes {
            let next_id = (provisioned.len() + 1).to_string();
            provisioned
                .entry((foreign_source.to_string(), node.foreign_id().to_string()))
                .or_insert(next_id);
        }
        self.upserts
            .lock()
            .unwrap()
            .push((foreign_source.to_string(), nodes.len()));
        Ok(())
    }

    async fn synchronize(&self, foreign_source: &str) -> Result<(), SinkError> {
        self.check_failure()?;
        self.synchronized.lock().unwrap().push(foreign_source.to_string());
        Ok(())
    }

    async fn submit_metrics(&self, node_id: &str, batch: &MetricBatch) -> Result<(), SinkError> {
        self.check_failure()?;
        self.submissions
            .lock()
            .unwrap()
            .push((node_id.to_string(), batch.resource_id.clone()));
        Ok(())
    }

    async fn find_node_by_foreign_id(
        &self,
        foreign_source: &str,
        foreign_id: &str,
    ) -> Result<Option<String>, SinkError> {
        self.check_failure()?;
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .get(&(foreign_source.to_string(), foreign_id.to_string()))
            .cloned())
    }
}
