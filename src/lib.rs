// Cloud Bridge - scheduling core
//
// Polls cloud providers for resources and metrics on recurring schedules,
// caches discovery results, tracks per-entity run status, and pushes nodes
// and measurements into OpenNMS.

pub mod bridge;
pub mod cache;
pub mod collection;
pub mod config;
pub mod discovery;
pub mod error;
pub mod model;
pub mod provider;
pub mod scheduler;
pub mod sink;
pub mod status;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, BridgeOptions, GlobalScheduleInfo};
pub use config::{ConfigManager, ScheduleConfig};
pub use error::BridgeError;
pub use model::{MetricBatch, Resource, RunState, RunStatus};
pub use provider::{CloudProvider, ProviderRegistry};
pub use sink::{MonitoringSink, OpenNmsClient};
