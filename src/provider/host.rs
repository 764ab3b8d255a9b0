// Host provider
//
// Treats the machine the bridge runs on as a single discoverable resource
// and collects its load average, memory/swap and per-mount disk usage.

use async_trait::async_trait;
use std::collections::HashSet;
use sysinfo::{Disks, System};
use tracing::debug;

use super::{CloudProvider, ProviderError};
use crate::model::{Metric, MetricBatch, Resource, ValidationResult};

pub const PROVIDER_TYPE: &str = "host";

/// Resource type reported for the local machine
pub const RESOURCE_TYPE: &str = "HOST";

const REGION: &str = "local";

/// Local machine provider
///
/// # What is Collected
/// - Load average over 1, 5 and 15 minutes, plus the CPU core count
/// - Memory and swap: total, used, available (MB) and used percentage
/// - Disk usage percentage per mount point (tagged with `mount_point`)
///
/// # Platform Support
/// - Linux / macOS: full support
/// - Windows: load average reports 0.0
pub struct HostProvider {
    id: String,
    display_name: String,

    /// Resolved once; doubles as the resource ID
    host_name: String,
}

impl HostProvider {
    pub fn new(id: &str, display_name: Option<String>) -> Self {
        let host_name = System::host_name().unwrap_or_else(|| "localhost".to_string());

        HostProvider {
            id: id.to_string(),
            display_name: display_name.unwrap_or_else(|| format!("Host {}", host_name)),
            host_name,
        }
    }

    fn bytes_to_mb(bytes: u64) -> f64 {
        bytes as f64 / (1024.0 * 1024.0)
    }

    /// Percentage (0.0 - 100.0), 0.0 when total is zero
    fn calculate_percentage(used: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64) * 100.0
        }
    }

    fn load_metrics(batch: &mut MetricBatch) {
        let load_avg = System::load_average();
        batch.add_metric("load_1min", load_avg.one);
        batch.add_metric("load_5min", load_avg.five);
        batch.add_metric("load_15min", load_avg.fifteen);
        batch.add_metric("cpu_cores", num_cpus::get() as f64);

        debug!(
            "Load average: 1min={:.2}, 5min={:.2}, 15min={:.2}",
            load_avg.one, load_avg.five, load_avg.fifteen
        );
    }

    fn memory_metrics(batch: &mut MetricBatch) {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory();
        let used = sys.used_memory();
        let total_swap = sys.total_swap();
        let used_swap = sys.used_swap();

        batch.add_metric("memory_total_mb", Self::bytes_to_mb(total));
        batch.add_metric("memory_used_mb", Self::bytes_to_mb(used));
        batch.add_metric("memory_available_mb", Self::bytes_to_mb(sys.available_memory()));
        batch.add_metric("memory_used_percent", Self::calculate_percentage(used, total));
        batch.add_metric("swap_total_mb", Self::bytes_to_mb(total_swap));
        batch.add_metric("swap_used_mb", Self::bytes_to_mb(used_swap));
        batch.add_metric(
            "swap_used_percent",
            Self::calculate_percentage(used_swap, total_swap),
        );
    }

    fn disk_metrics(batch: &mut MetricBatch) {
        let disks = Disks::new_with_refreshed_list();

        for disk in disks.list() {
            let mount_point = disk.mount_point().to_string_lossy().to_string();
            let total = disk.total_space();
            let used = total.saturating_sub(disk.available_space());
            let used_percent = Self::calculate_percentage(used, total);

            debug!("Disk {}: {:.1}% used", mount_point, used_percent);

            batch.push(
                Metric::new("disk_used_percent", used_percent)
                    .with_tag("mount_point", mount_point),
            );
        }
    }
}

#[async_trait]
impl CloudProvider for HostProvider {
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
        Ok(ValidationResult::valid().with_message(format!("Local host '{}'", self.host_name)))
    }

    async fn discover(&self) -> Result<HashSet<Resource>, ProviderError> {
        let mut resource = Resource::new(&self.host_name, &self.host_name, RESOURCE_TYPE, REGION)
            .with_status("running")
            .with_property("cpuCores", num_cpus::get())
            .owned_by(&self.id, PROVIDER_TYPE);

        if let Some(os) = System::long_os_version() {
            resource = resource.with_tag("os", os);
        }
        if let Some(kernel) = System::kernel_version() {
            resource = resource.with_tag("kernel", kernel);
        }

        Ok(HashSet::from([resource]))
    }

    async fn collect(&self, resource: &Resource) -> Result<MetricBatch, ProviderError> {
        if resource.id != self.host_name {
            return Err(ProviderError::new(
                &self.id,
                format!("Resource '{}' is not this host", resource.id),
            )
            .with_resource(&resource.id)
            .with_code("UNKNOWN_RESOURCE"));
        }

        debug!("Collecting host metrics for {}", self.host_name);

        let mut batch = MetricBatch::new(&resource.id)
            .with_tag("providerId", &self.id)
            .with_tag("region", REGION);

        Self::load_metrics(&mut batch);
        Self::memory_metrics(&mut batch);
        Self::disk_metrics(&mut batch);

        Ok(batch)
    }
}
