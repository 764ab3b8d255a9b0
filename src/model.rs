// Data model shared by providers, orchestrators and the downstream sink
//
// Resources and metric batches are immutable snapshots produced by a
// provider call. RunStatus is the mutable per-entity record owned by the
// status tracker; everything else is created, handed on, and dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Property key carrying the back-reference to the discovering provider
pub const PROVIDER_ID_PROPERTY: &str = "providerId";

/// Property key carrying the discovering provider's type (e.g. "docker")
pub const PROVIDER_TYPE_PROPERTY: &str = "providerType";

/// Property keys that hold an address usable as a node interface
const IP_ADDRESS_PROPERTIES: [&str; 3] = ["ipAddress", "privateIpAddress", "publicIpAddress"];

/// A discovered cloud entity (VM instance, container, host)
///
/// Equality and hashing use `id` alone. Resource IDs are treated as globally
/// unique, which holds for the IDs cloud and container backends hand out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Identifier unique within (and in practice across) providers
    pub id: String,

    /// Human-readable name, used as the node label downstream
    pub display_name: String,

    /// Backend resource kind (e.g. "EC2", "CONTAINER", "HOST")
    pub resource_type: String,

    /// Region or location the resource lives in
    pub region: String,

    /// Free-form provider-reported state ("running", "exited", ...)
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Arbitrary provider properties, including `providerId`
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl Resource {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        resource_type: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Resource {
            id: id.into(),
            display_name: display_name.into(),
            resource_type: resource_type.into(),
            region: region.into(),
            status: String::new(),
            tags: HashMap::new(),
            properties: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Stamps the provider back-references onto the resource
    pub fn owned_by(self, provider_id: &str, provider_type: &str) -> Self {
        self.with_property(PROVIDER_ID_PROPERTY, provider_id)
            .with_property(PROVIDER_TYPE_PROPERTY, provider_type)
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.properties
            .get(PROVIDER_ID_PROPERTY)
            .and_then(Value::as_str)
    }

    pub fn provider_type(&self) -> Option<&str> {
        self.properties
            .get(PROVIDER_TYPE_PROPERTY)
            .and_then(Value::as_str)
    }

    /// Collects every non-empty address-like property
    pub fn ip_addresses(&self) -> BTreeSet<String> {
        IP_ADDRESS_PROPERTIES
            .iter()
            .filter_map(|key| self.properties.get(*key))
            .filter_map(Value::as_str)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A resource expressed in the monitoring system's vocabulary
///
/// Identity is the `(id, provider_id)` pair. Built during discovery
/// post-processing and consumed once by the reconciliation push.
#[derive(Debug, Clone)]
pub struct DiscoveredNode {
    pub id: String,
    pub name: String,
    pub node_type: String,
    pub provider_id: String,
    pub region: String,
    pub discovery_time: DateTime<Utc>,
    pub ip_addresses: BTreeSet<String>,
    pub tags: HashMap<String, String>,
    pub attributes: HashMap<String, Value>,
    pub resource: Option<Resource>,
}

impl DiscoveredNode {
    /// Translates a discovered resource into a node for `provider_id`
    pub fn from_resource(resource: &Resource, provider_id: &str) -> Self {
        let mut attributes = resource.properties.clone();
        attributes.insert("status".to_string(), Value::from(resource.status.clone()));

        DiscoveredNode {
            id: resource.id.clone(),
            name: resource.display_name.clone(),
            node_type: resource.resource_type.clone(),
            provider_id: provider_id.to_string(),
            region: resource.region.clone(),
            discovery_time: Utc::now(),
            ip_addresses: resource.ip_addresses(),
            tags: resource.tags.clone(),
            attributes,
            resource: Some(resource.clone()),
        }
    }

    /// Foreign ID under which the node is upserted
    pub fn foreign_id(&self) -> &str {
        &self.id
    }

    pub fn node_label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Monitoring location; the region doubles as the location name
    pub fn location(&self) -> &str {
        &self.region
    }
}

impl PartialEq for DiscoveredNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.provider_id == other.provider_id
    }
}

impl Eq for DiscoveredNode {}

impl Hash for DiscoveredNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.provider_id.hash(state);
    }
}

/// One named metric value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Metric {
            name: name.into(),
            value,
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A metric snapshot for one resource
///
/// Equality is by `(resource_id, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBatch {
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl MetricBatch {
    /// Creates an empty batch stamped with the current time
    pub fn new(resource_id: impl Into<String>) -> Self {
        MetricBatch {
            resource_id: resource_id.into(),
            timestamp: Utc::now(),
            metrics: Vec::new(),
            tags: HashMap::new(),
        }
    }

    pub fn add_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.push(Metric::new(name, value));
    }

    pub fn push(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl PartialEq for MetricBatch {
    fn eq(&self, other: &Self) -> bool {
        self.resource_id == other.resource_id && self.timestamp == other.timestamp
    }
}

/// Outcome of a provider's self-check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        ValidationResult {
            valid: true,
            messages: Vec::new(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ValidationResult {
            valid: false,
            messages: vec![message.into()],
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// All messages joined into one line
    pub fn message(&self) -> String {
        self.messages.join("; ")
    }
}

/// Run state of a tracked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Known but never scheduled nor run
    Pending,
    /// Timer armed, waiting for the next tick
    Scheduled,
    Running,
    Completed,
    Failed,
    /// Schedule stopped while still waiting for its next run
    Disabled,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Pending => "PENDING",
            RunState::Scheduled => "SCHEDULED",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Disabled => "DISABLED",
        };
        f.write_str(name)
    }
}

/// Which family of runs a status record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Keyed by provider ID
    Discovery,
    /// Keyed by resource ID
    Collection,
}

/// Per-entity run record
///
/// Invariants maintained by the tracker:
/// - `last_end_time >= last_start_time` when both are set
/// - `state == Running` implies `last_end_time` is unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub kind: EntityKind,

    /// Provider ID (discovery) or resource ID (collection)
    pub entity_id: String,

    /// Provider type (discovery) or resource type (collection)
    pub entity_type: Option<String>,

    /// Owning provider; equals `entity_id` for discovery records
    pub provider_id: Option<String>,

    pub state: RunState,
    pub last_start_time: Option<DateTime<Utc>>,
    pub last_end_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub consecutive_failure_count: u32,

    /// Resources discovered or metrics collected by the last successful run
    pub last_result_count: usize,

    pub scheduled: bool,
    pub schedule_interval: Option<Duration>,
    pub next_scheduled_run: Option<DateTime<Utc>>,
    pub job_id: Option<String>,
}

impl RunStatus {
    pub fn new(kind: EntityKind, entity_id: impl Into<String>) -> Self {
        RunStatus {
            kind,
            entity_id: entity_id.into(),
            entity_type: None,
            provider_id: None,
            state: RunState::Pending,
            last_start_time: None,
            last_end_time: None,
            last_success_time: None,
            last_error_message: None,
            consecutive_failure_count: 0,
            last_result_count: 0,
            scheduled: false,
            schedule_interval: None,
            next_scheduled_run: None,
            job_id: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}
