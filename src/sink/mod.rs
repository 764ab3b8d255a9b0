// Sink module - pushes discovered nodes and metrics into the monitoring system
//
// This module is responsible for:
// 1. Defining the MonitoringSink capability (idempotent upsert + submission)
// 2. Deriving the foreign source a provider's nodes live under
// 3. Retrying failed sink calls once before giving up (Reconciler)

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::model::{DiscoveredNode, MetricBatch};

pub mod opennms;

pub use opennms::OpenNmsClient;

/// Errors that can occur while talking to the monitoring system
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} rejected with HTTP status {status}")]
    Rejected { operation: String, status: u16 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Monitoring system unavailable: {0}")]
    Unavailable(String),
}

/// The downstream monitoring system
///
/// Every operation is idempotent on the monitoring side, which is what makes
/// retrying a failed call safe.
#[async_trait]
pub trait MonitoringSink: Send + Sync {
    /// Creates or updates `nodes` under `foreign_source`
    async fn upsert_nodes(&self, foreign_source: &str, nodes: &[DiscoveredNode]) -> Result<(), SinkError>;

    /// Applies pending node changes for `foreign_source`
    async fn synchronize(&self, foreign_source: &str) -> Result<(), SinkError>;

    async fn submit_metrics(&self, node_id: &str, batch: &MetricBatch) -> Result<(), SinkError>;

    /// Monitoring-side node ID for a provisioned resource, if any
    async fn find_node_by_foreign_id(
        &self,
        foreign_source: &str,
        foreign_id: &str,
    ) -> Result<Option<String>, SinkError>;
}

/// Foreign source a provider's nodes are upserted under
pub fn foreign_source(provider_type: &str, provider_id: &str) -> String {
    format!("cloud-{}-{}", provider_type, provider_id)
}

/// Result of a metrics push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Submitted { node_id: String },

    /// No node provisioned for the resource; the batch was discarded
    Dropped,
}

const MAX_RETRIES: u32 = 1;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Best-effort, retrying front of a `MonitoringSink`
///
/// A failed call is retried `max_retries` times after a brief delay, then
/// reported. Callers log the error; nothing here touches local state.
pub struct Reconciler {
    sink: Arc<dyn MonitoringSink>,
    max_retries: u32,
    retry_delay: Duration,
}

impl Reconciler {
    pub fn new(sink: Arc<dyn MonitoringSink>) -> Self {
        Reconciler {
            sink,
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, SinkError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("{} succeeded after {} retry(ies)", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!("{} failed (attempt {}): {}. Retrying...", operation, attempt, e);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        "{} failed after {} attempt(s): {}. Giving up.",
                        operation,
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Upserts a provider's full node set, then synchronizes it
    pub async fn push_nodes(
        &self,
        provider_type: &str,
        provider_id: &str,
        nodes: &[DiscoveredNode],
    ) -> Result<(), SinkError> {
        let fs = foreign_source(provider_type, provider_id);
        let fs = fs.as_str();
        let sink = &self.sink;

        self.with_retry("Node upsert", move || sink.upsert_nodes(fs, nodes))
            .await?;
        self.with_retry("Requisition synchronize", move || sink.synchronize(fs))
            .await?;

        info!("Pushed {} node(s) to foreign source '{}'", nodes.len(), fs);
        Ok(())
    }

    /// Submits a batch to the node provisioned for its resource
    ///
    /// Metrics for a resource without a node are dropped with a warning.
    pub async fn push_metrics(
        &self,
        provider_type: &str,
        provider_id: &str,
        batch: &MetricBatch,
    ) -> Result<PushOutcome, SinkError> {
        let fs = foreign_source(provider_type, provider_id);
        let fs = fs.as_str();
        let foreign_id = batch.resource_id.as_str();
        let sink = &self.sink;

        let node_id = self
            .with_retry("Node lookup", move || sink.find_node_by_foreign_id(fs, foreign_id))
            .await?;

        let Some(node_id) = node_id else {
            warn!(
                "No node provisioned for '{}' in '{}', dropping {} metric(s)",
                foreign_id,
                fs,
                batch.len()
            );
            return Ok(PushOutcome::Dropped);
        };

        let node = node_id.as_str();
        self.with_retry("Metric submission", move || sink.submit_metrics(node, batch))
            .await?;

        debug!("Submitted {} metric(s) for node {}", batch.len(), node_id);
        Ok(PushOutcome::Submitted { node_id })
    }
}
