// OpenNMS REST client
//
// Implements MonitoringSink over the OpenNMS v2 REST API: requisition
// upserts and imports for nodes, measurement submission for metrics.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{MonitoringSink, SinkError};
use crate::config::OpenNmsSettings;
use crate::model::{DiscoveredNode, Metric, MetricBatch};

/// OpenNMS client with basic auth and a per-request timeout
pub struct OpenNmsClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,

    /// Monitoring location for nodes without a region
    default_location: String,
}

impl OpenNmsClient {
    pub fn new(settings: &OpenNmsSettings) -> Result<Self, SinkError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(OpenNmsClient {
            http,
            base_url: normalize_base_url(&settings.base_url),
            username: settings.username.clone(),
            password: settings.password.clone(),
            default_location: settings.location.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Checks that the server answers and accepts our credentials
    ///
    /// Tries the v1 info endpoint first, then the v2 one.
    pub async fn test_connection(&self) -> Result<(), SinkError> {
        let mut last_status = None;

        for path in ["rest/info", "api/v2/info"] {
            let url = self.url(path);
            debug!("Testing OpenNMS connection at {}", url);

            let response = self
                .http
                .get(&url)
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                info!("Connected to OpenNMS at {}", self.base_url);
                return Ok(());
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(SinkError::Rejected {
                    operation: "Authentication".to_string(),
                    status: status.as_u16(),
                });
            }

            warn!("OpenNMS info endpoint {} returned {}", url, status);
            last_status = Some(status);
        }

        Err(SinkError::Unavailable(format!(
            "no info endpoint answered at {} (last status {})",
            self.base_url,
            last_status.map(|s| s.as_u16()).unwrap_or_default()
        )))
    }
}

/// Ensures the base URL points at the `/opennms` context, without a trailing slash
fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/opennms") {
        trimmed.to_string()
    } else {
        format!("{}/opennms", trimmed)
    }
}

fn check_status(operation: &str, response: Response) -> Result<Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(SinkError::Rejected {
            operation: operation.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Requisition document for a provider's node set
fn requisition_body(foreign_source: &str, nodes: &[DiscoveredNode], default_location: &str) -> Value {
    let nodes: Vec<Value> = nodes
        .iter()
        .map(|node| requisition_node(node, default_location))
        .collect();
    json!({
        "foreign-source": foreign_source,
        "nodes": nodes,
    })
}

fn requisition_node(node: &DiscoveredNode, default_location: &str) -> Value {
    let location = match node.location() {
        "" => default_location,
        location => location,
    };

    let interfaces: Vec<Value> = node
        .ip_addresses
        .iter()
        .map(|addr| json!({ "ip-addr": addr, "snmp-primary": "N" }))
        .collect();

    let mut meta_data: Vec<Value> = vec![
        json!({ "context": "cloud", "key": "providerId", "value": node.provider_id }),
        json!({ "context": "cloud", "key": "type", "value": node.node_type }),
        json!({ "context": "cloud", "key": "region", "value": node.region }),
    ];

    let mut tags: Vec<(&String, &String)> = node.tags.iter().collect();
    tags.sort();
    meta_data.extend(
        tags.into_iter()
            .map(|(key, value)| json!({ "context": "tags", "key": key, "value": value })),
    );

    json!({
        "foreign-id": node.foreign_id(),
        "node-label": node.node_label(),
        "location": location,
        "interfaces": interfaces,
        "meta-data": meta_data,
    })
}

/// Measurement key; tagged metrics get their tag values appended so that
/// e.g. per-mount disk metrics stay distinct
fn metric_key(metric: &Metric) -> String {
    if metric.tags.is_empty() {
        return metric.name.clone();
    }

    let mut tags: Vec<(&String, &String)> = metric.tags.iter().collect();
    tags.sort();
    let suffix: Vec<&str> = tags.iter().map(|(_, value)| value.as_str()).collect();
    format!("{}[{}]", metric.name, suffix.join(","))
}

fn measurements_body(node_id: &str, batch: &MetricBatch) -> Value {
    let metrics: Map<String, Value> = batch
        .metrics
        .iter()
        .map(|metric| (metric_key(metric), json!(metric.value)))
        .collect();

    json!({
        "node": node_id,
        "timestamp": batch.timestamp.timestamp_millis(),
        "metrics": metrics,
    })
}

/// First node ID of a node search response
///
/// OpenNMS reports IDs as numbers; strings are accepted as well.
fn node_id_from_response(body: &Value) -> Option<String> {
    let first = body.get("nodes").or_else(|| body.get("node"))?.as_array()?.first()?;
    match first.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl MonitoringSink for OpenNmsClient {
    async fn upsert_nodes(&self, foreign_source: &str, nodes: &[DiscoveredNode]) -> Result<(), SinkError> {
        debug!("Upserting {} node(s) into '{}'", nodes.len(), foreign_source);

        let response = self
            .http
            .post(self.url("api/v2/requisitions"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&requisition_body(foreign_source, nodes, &self.default_location))
            .send()
            .await?;

        check_status("Requisition upsert", response)?;
        Ok(())
    }

    async fn synchronize(&self, foreign_source: &str) -> Result<(), SinkError> {
        debug!("Importing requisition '{}'", foreign_source);

        let response = self
            .http
            .put(self.url(&format!("api/v2/requisitions/{}/import", foreign_source)))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        check_status("Requisition import", response)?;
        Ok(())
    }

    async fn submit_metrics(&self, node_id: &str, batch: &MetricBatch) -> Result<(), SinkError> {
        debug!("Submitting {} metric(s) for node {}", batch.len(), node_id);

        let response = self
            .http
            .post(self.url("api/v2/measurements"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&measurements_body(node_id, batch))
            .send()
            .await?;

        check_status("Measurement submission", response)?;
        Ok(())
    }

    async fn find_node_by_foreign_id(
        &self,
        foreign_source: &str,
        foreign_id: &str,
    ) -> Result<Option<String>, SinkError> {
        let response = self
            .http
            .get(self.url("api/v2/nodes"))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("foreignSource", foreign_source),
                ("foreignId", foreign_id),
                ("limit", "1"),
            ])
            .send()
            .await?;

        // OpenNMS answers an empty search with 204
        if matches!(response.status(), StatusCode::NO_CONTENT | StatusCode::NOT_FOUND) {
            return Ok(None);
        }

        let body: Value = check_status("Node lookup", response)?
            .json()
            .await
            .map_err(|e| SinkError::InvalidResponse(e.to_string()))?;

        Ok(node_id_from_response(&body))
    }
}
