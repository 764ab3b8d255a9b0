// Provider module - the pluggable cloud backend capability
//
// This module provides the core trait that every backend implements,
// enabling new backends to be added without touching the scheduler or
// the orchestrators.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::ProviderSettings;
use crate::error::BridgeError;
use crate::model::{MetricBatch, Resource, ValidationResult};

pub mod docker;
pub mod host;
mod registry;

pub use registry::ProviderRegistry;

/// A failed call into a cloud backend
///
/// Carries the originating provider, the resource when the failure was
/// resource-specific, and the backend's error code when it reported one.
#[derive(Error, Debug, Clone)]
#[error("provider '{provider_id}': {message}")]
pub struct ProviderError {
    pub provider_id: String,
    pub resource_id: Option<String>,
    pub code: Option<String>,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError {
            provider_id: provider_id.into(),
            resource_id: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Core trait that all cloud backends must implement.
///
/// # Design
/// - **Async-first**: backend calls are network/API I/O and must not block the runtime
/// - **Errors carry origin**: every failure names the provider (and resource, when known)
/// - **Snapshots**: `discover` returns the full current set; the caller replaces, never merges
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Stable identifier, unique among registered providers
    fn provider_id(&self) -> &str;

    /// Backend kind, e.g. "docker"; part of the downstream foreign source
    fn provider_type(&self) -> &str;

    fn display_name(&self) -> &str {
        self.provider_id()
    }

    /// Checks credentials/connectivity without discovering anything
    async fn validate(&self) -> Result<ValidationResult, ProviderError>;

    /// Lists every resource the backend currently reports
    async fn discover(&self) -> Result<HashSet<Resource>, ProviderError>;

    /// Fetches the current metric snapshot for one resource
    async fn collect(&self, resource: &Resource) -> Result<MetricBatch, ProviderError>;
}

/// Error code recorded when a provider call panics
pub const PANIC_CODE: &str = "PROVIDER_PANIC";

/// Awaits a provider call, turning a panic inside it into a `ProviderError`
pub async fn catch_panic<T, F>(provider_id: &str, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::new(provider_id, "provider call panicked").with_code(PANIC_CODE)),
    }
}

/// Instantiates a provider from its settings entry
///
/// # Errors
/// * `BridgeError::Configuration` - unknown provider type
/// * `BridgeError::Provider` - the backend could not be initialized (e.g. no Docker socket)
pub fn build_provider(settings: &ProviderSettings) -> Result<Arc<dyn CloudProvider>, BridgeError> {
    let display_name = settings.display_name.clone();

    let provider: Arc<dyn CloudProvider> = match settings.provider_type.as_str() {
        host::PROVIDER_TYPE => Arc::new(host::HostProvider::new(&settings.id, display_name)),
        docker::PROVIDER_TYPE => Arc::new(docker::DockerProvider::connect(&settings.id, display_name)?),
        other => {
            return Err(BridgeError::config(format!(
                "Unknown provider type '{}' for provider '{}'",
                other, settings.id
            )))
        }
    };

    info!(
        "Built provider '{}' ({})",
        provider.provider_id(),
        provider.provider_type()
    );

    Ok(provider)
}
