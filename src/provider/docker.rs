// Docker provider
//
// Discovers containers from the local Docker daemon and collects a one-shot
// stats snapshot (CPU, memory, network and block I/O) per container.

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, Stats, StatsOptions};
use bollard::models::ContainerSummary;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{CloudProvider, ProviderError};
use crate::model::{MetricBatch, Resource, ValidationResult};

pub const PROVIDER_TYPE: &str = "docker";

pub const RESOURCE_TYPE: &str = "CONTAINER";

const REGION: &str = "local";

/// Length of the short container ID used as the resource ID
const SHORT_ID_LEN: usize = 12;

/// Docker daemon provider
///
/// # Requirements
/// - Docker daemon must be running
/// - User must have permissions to access Docker socket
/// - Default socket: unix:///var/run/docker.sock (Linux/macOS)
/// - Default socket: npipe:////./pipe/docker_engine (Windows)
///
/// Every container (running or not) is discovered; only running containers
/// report meaningful stats.
pub struct DockerProvider {
    id: String,
    display_name: String,
    docker: Docker,
}

impl DockerProvider {
    /// Creates a provider bound to the local daemon
    ///
    /// Tries the default socket first, then falls back to `DOCKER_HOST`
    /// and related environment variables.
    pub fn connect(id: &str, display_name: Option<String>) -> Result<Self, ProviderError> {
        let docker = Docker::connect_with_socket_defaults()
            .or_else(|_| Docker::connect_with_local_defaults())
            .map_err(|e| {
                ProviderError::new(id, format!("Failed to connect to Docker daemon: {}", e))
                    .with_code("CONNECTION_FAILED")
            })?;

        Ok(DockerProvider {
            id: id.to_string(),
            display_name: display_name.unwrap_or_else(|| "Docker".to_string()),
            docker,
        })
    }

    fn bytes_to_mb(bytes: u64) -> f64 {
        bytes as f64 / (1024.0 * 1024.0)
    }

    fn short_id(id: &str) -> &str {
        &id[..SHORT_ID_LEN.min(id.len())]
    }

    fn error(&self, e: bollard::errors::Error) -> ProviderError {
        let err = ProviderError::new(&self.id, e.to_string());
        match e {
            bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
                err.with_code(status_code.to_string())
            }
            _ => err,
        }
    }

    /// Maps a container listing entry to a resource owned by `provider_id`
    fn container_to_resource(provider_id: &str, container: ContainerSummary) -> Option<Resource> {
        let full_id = container.id?;
        let id = Self::short_id(&full_id).to_string();

        let name = container
            .names
            .and_then(|names| names.first().map(|n| n.trim_start_matches('/').to_string()))
            .unwrap_or_else(|| id.clone());

        let mut resource = Resource::new(&id, name, RESOURCE_TYPE, REGION)
            .with_status(container.state.unwrap_or_default())
            .with_property("containerId", full_id.as_str())
            .owned_by(provider_id, PROVIDER_TYPE);

        if let Some(image) = container.image {
            resource = resource.with_property("image", image);
        }

        if let Some(labels) = container.labels {
            resource.tags.extend(labels);
        }

        let ip_address = container
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| {
                networks
                    .into_values()
                    .filter_map(|endpoint| endpoint.ip_address)
                    .find(|addr| !addr.is_empty())
            });
        if let Some(ip_address) = ip_address {
            resource = resource.with_property("ipAddress", ip_address);
        }

        Some(resource)
    }

    /// Calculates CPU usage percentage from Docker stats
    ///
    /// Docker provides cumulative CPU usage in nanoseconds.
    ///
    /// # Formula
    /// cpu_percent = (cpu_delta / system_cpu_delta) * num_cpus * 100.0
    fn calculate_cpu_percent(stats: &Stats) -> f64 {
        let cpu_total = stats.cpu_stats.cpu_usage.total_usage as f64;
        let precpu_total = stats.precpu_stats.cpu_usage.total_usage as f64;

        let system_cpu = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let presystem_cpu = stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;

        let cpu_delta = cpu_total - precpu_total;
        let system_delta = system_cpu - presystem_cpu;

        if system_delta <= 0.0 || cpu_delta <= 0.0 {
            return 0.0;
        }

        let num_cpus = stats
            .cpu_stats
            .online_cpus
            .unwrap_or_else(|| num_cpus::get() as u64) as f64;

        (cpu_delta / system_delta) * num_cpus * 100.0
    }

    fn stats_to_batch(resource_id: &str, provider_id: &str, stats: &Stats) -> MetricBatch {
        let cpu_percent = Self::calculate_cpu_percent(stats);

        let memory_used = stats.memory_stats.usage.unwrap_or(0);
        let memory_limit = stats.memory_stats.limit.unwrap_or(0);
        let memory_percent = if memory_limit > 0 {
            (memory_used as f64 / memory_limit as f64) * 100.0
        } else {
            0.0
        };

        // Sum of all interfaces
        let (network_rx, network_tx) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks.values().fold((0u64, 0u64), |(rx, tx), net| {
                    (rx + net.rx_bytes, tx + net.tx_bytes)
                })
            })
            .unwrap_or((0, 0));

        let (block_read, block_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|io_stats| {
                io_stats.iter().fold((0u64, 0u64), |(read, write), stat| {
                    match stat.op.as_str() {
                        "read" | "Read" => (read + stat.value, write),
                        "write" | "Write" => (read, write + stat.value),
                        _ => (read, write),
                    }
                })
            })
            .unwrap_or((0, 0));

        debug!(
            "Container {}: CPU={:.1}%, Mem={:.1}/{:.1}MB ({:.1}%)",
            resource_id,
            cpu_percent,
            Self::bytes_to_mb(memory_used),
            Self::bytes_to_mb(memory_limit),
            memory_percent
        );

        let mut batch = MetricBatch::new(resource_id)
            .with_tag("providerId", provider_id)
            .with_tag("region", REGION);
        batch.add_metric("cpu_percent", cpu_percent);
        batch.add_metric("memory_used_mb", Self::bytes_to_mb(memory_used));
        batch.add_metric("memory_limit_mb", Self::bytes_to_mb(memory_limit));
        batch.add_metric("memory_percent", memory_percent);
        batch.add_metric("network_rx_mb", Self::bytes_to_mb(network_rx));
        batch.add_metric("network_tx_mb", Self::bytes_to_mb(network_tx));
        batch.add_metric("block_read_mb", Self::bytes_to_mb(block_read));
        batch.add_metric("block_write_mb", Self::bytes_to_mb(block_write));
        batch
    }
}

#[async_trait]
impl CloudProvider for DockerProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn validate(&self) -> Result<ValidationResult, ProviderError> {
        match self.docker.ping().await {
            Ok(_) => Ok(ValidationResult::valid()),
            Err(e) => {
                warn!("Docker daemon for provider '{}' unreachable: {}", self.id, e);
                Ok(ValidationResult::invalid(format!("Docker daemon unreachable: {}", e)))
            }
        }
    }

    async fn discover(&self) -> Result<HashSet<Resource>, ProviderError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| self.error(e))?;

        debug!("Found {} container(s)", containers.len());

        Ok(containers
            .into_iter()
            .filter_map(|c| Self::container_to_resource(&self.id, c))
            .collect())
    }

    async fn collect(&self, resource: &Resource) -> Result<MetricBatch, ProviderError> {
        let stats_options = StatsOptions {
            stream: false,
            ..Default::default()
        };

        let mut stats_stream = self.docker.stats(&resource.id, Some(stats_options));

        match stats_stream.next().await {
            Some(Ok(stats)) => Ok(Self::stats_to_batch(&resource.id, &self.id, &stats)),
            Some(Err(e)) => Err(self.error(e).with_resource(&resource.id)),
            None => Err(ProviderError::new(&self.id, "Docker returned no stats")
                .with_resource(&resource.id)
                .with_code("NO_STATS")),
        }
    }
}
