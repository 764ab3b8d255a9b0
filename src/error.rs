// Crate-level error type
//
// Three kinds of failure reach callers of the bridge:
// - Provider: the cloud backend call failed (recorded on the entity's status)
// - Configuration: unknown provider, unresolvable resource, bad schedule
// - Downstream: the monitoring system push failed (never reverts local state)

use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::ProviderError;
use crate::sink::SinkError;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Downstream push failed: {0}")]
    Downstream(#[from] SinkError),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::Configuration(msg.into())
    }

    /// Provider the failure originated from, when known
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            BridgeError::Provider(e) => Some(&e.provider_id),
            _ => None,
        }
    }

    /// Backend error code, when the provider reported one
    pub fn error_code(&self) -> Option<&str> {
        match self {
            BridgeError::Provider(e) => e.code.as_deref(),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, BridgeError::Configuration(_))
    }
}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Configuration(e.to_string())
    }
}
