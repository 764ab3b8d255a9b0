// Configuration module - settings retrieval and schedule configuration
//
// This module is responsible for:
// 1. Connecting to MongoDB using the provided connection string
// 2. Fetching the bridge settings document from the BridgeSettings collection
// 3. Turning loosely written durations ("30s", "5m", 90) into typed schedules
// 4. Validating schedule changes once, at the boundary, before they are applied

use bson::doc;
use mongodb::{Client, Collection, Database};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur during configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("MongoDB connection failed: {0}")]
    MongoConnectionError(#[from] mongodb::error::Error),

    #[error("Settings document not found for key: {0}")]
    SettingsNotFound(String),

    #[error("Invalid settings format: {0}")]
    InvalidSettings(String),

    #[error("Invalid duration '{value}' for {field}")]
    InvalidDuration { field: String, value: String },
}

/// Default cadence of the global discovery pass
pub const DEFAULT_DISCOVERY_SCHEDULE: ScheduleConfig = ScheduleConfig {
    enabled: true,
    initial_delay: Duration::from_secs(30),
    interval: Duration::from_secs(5 * 60),
};

/// Default cadence of the global collection pass
pub const DEFAULT_COLLECTION_SCHEDULE: ScheduleConfig = ScheduleConfig {
    enabled: true,
    initial_delay: Duration::from_secs(60),
    interval: Duration::from_secs(60),
};

fn default_max_concurrent_collections() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_location() -> String {
    "Default".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Main configuration structure loaded from MongoDB
///
/// One document per bridge instance, identified by `key`.
///
/// # Example MongoDB Document
/// ```json
/// {
///   "key": "bridge-1",
///   "scheduler": {
///     "discovery":  { "enabled": true, "initial_delay": "30s", "interval": "5m" },
///     "collection": { "enabled": true, "initial_delay": "1m",  "interval": 60 }
///   },
///   "providers": [
///     { "id": "local", "type": "host" },
///     { "id": "containers", "type": "docker", "discovery": { "interval": "2m" } }
///   ],
///   "opennms": {
///     "base_url": "http://opennms:8980/opennms",
///     "username": "admin",
///     "password": "admin"
///   }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    /// Unique identifier for this configuration (e.g., "bridge-1")
    pub key: String,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Providers to register at startup
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,

    /// Downstream monitoring system
    pub opennms: OpenNmsSettings,

    /// Upper bound on concurrent resource collections within one pass
    #[serde(default = "default_max_concurrent_collections")]
    pub max_concurrent_collections: usize,
}

/// Global discovery and collection schedules
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default)]
    pub discovery: ScheduleSettings,

    #[serde(default)]
    pub collection: ScheduleSettings,
}

impl SchedulerSettings {
    pub fn discovery_schedule(&self) -> Result<ScheduleConfig, ConfigError> {
        self.discovery.resolve(DEFAULT_DISCOVERY_SCHEDULE)
    }

    pub fn collection_schedule(&self) -> Result<ScheduleConfig, ConfigError> {
        self.collection.resolve(DEFAULT_COLLECTION_SCHEDULE)
    }
}

/// Schedule as written in the settings document; every field optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleSettings {
    pub enabled: Option<bool>,

    #[serde(default, deserialize_with = "deserialize_duration")]
    pub initial_delay: Option<Duration>,

    #[serde(default, deserialize_with = "deserialize_duration")]
    pub interval: Option<Duration>,
}

impl ScheduleSettings {
    /// Fills unset fields from `defaults` and validates the result
    pub fn resolve(&self, defaults: ScheduleConfig) -> Result<ScheduleConfig, ConfigError> {
        let config = ScheduleConfig {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            interval: self.interval.unwrap_or(defaults.interval),
        };
        config.validate()?;
        Ok(config)
    }
}

/// A provider to instantiate at startup
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub id: String,

    /// Backend kind: "host" or "docker"
    #[serde(rename = "type")]
    pub provider_type: String,

    pub display_name: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Dedicated discovery schedule; such providers are skipped by the global pass
    pub discovery: Option<ScheduleSettings>,
}

/// Connection settings for the OpenNMS REST API
#[derive(Clone, Deserialize)]
pub struct OpenNmsSettings {
    /// e.g. "http://opennms:8980/opennms"
    pub base_url: String,
    pub username: String,
    pub password: String,

    /// Monitoring location assigned to nodes without a region
    #[serde(default = "default_location")]
    pub location: String,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl fmt::Debug for OpenNmsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenNmsSettings")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"****")
            .field("location", &self.location)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Longest accepted initial delay or interval (one year)
pub const MAX_SCHEDULE_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A validated recurring schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl ScheduleConfig {
    pub fn new(initial_delay: Duration, interval: Duration) -> Self {
        ScheduleConfig {
            enabled: true,
            initial_delay,
            interval,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Interval must be positive; both durations at most `MAX_SCHEDULE_DURATION`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidSettings(
                "schedule interval must be greater than zero".to_string(),
            ));
        }
        for (field, value) in [("initialDelay", self.initial_delay), ("interval", self.interval)] {
            if value > MAX_SCHEDULE_DURATION {
                return Err(ConfigError::InvalidSettings(format!(
                    "schedule {} {:?} exceeds the maximum of {:?}",
                    field, value, MAX_SCHEDULE_DURATION
                )));
            }
        }
        Ok(())
    }
}

/// A partial change to a live schedule, parsed from an untyped admin payload
///
/// Recognized keys: `enabled` (bool), `initialDelay` / `initial_delay` and
/// `interval` (duration). Parsing either fully succeeds or changes nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleUpdate {
    pub enabled: Option<bool>,
    pub initial_delay: Option<Duration>,
    pub interval: Option<Duration>,
}

impl ScheduleUpdate {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let object = value.as_object().ok_or_else(|| {
            ConfigError::InvalidSettings("schedule update must be an object".to_string())
        })?;

        let enabled = match object.get("enabled") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(flag)) => Some(*flag),
            Some(other) => {
                return Err(ConfigError::InvalidSettings(format!(
                    "'enabled' must be a boolean, got {}",
                    other
                )))
            }
        };

        let initial_delay = object
            .get("initialDelay")
            .or_else(|| object.get("initial_delay"))
            .filter(|v| !v.is_null())
            .map(|v| duration_from_value("initialDelay", v))
            .transpose()?;

        let interval = object
            .get("interval")
            .filter(|v| !v.is_null())
            .map(|v| duration_from_value("interval", v))
            .transpose()?;

        Ok(ScheduleUpdate {
            enabled,
            initial_delay,
            interval,
        })
    }

    /// Produces the schedule that results from applying this update
    ///
    /// `current` is never modified; the caller swaps in the result only
    /// when it validates.
    pub fn apply_to(&self, current: &ScheduleConfig) -> Result<ScheduleConfig, ConfigError> {
        let next = ScheduleConfig {
            enabled: self.enabled.unwrap_or(current.enabled),
            initial_delay: self.initial_delay.unwrap_or(current.initial_delay),
            interval: self.interval.unwrap_or(current.interval),
        };
        next.validate()?;
        Ok(next)
    }
}

/// Parses a duration string such as "250ms", "30s", "5m" or "1h"
///
/// A bare number is taken as milliseconds.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let trimmed = text.trim();
    let invalid = || ConfigError::InvalidDuration {
        field: "duration".to_string(),
        value: text.to_string(),
    };

    // (digits, milliseconds per unit)
    let (digits, unit_ms) = if let Some(n) = trimmed.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = trimmed.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = trimmed.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = trimmed.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (trimmed, 1)
    };

    let amount: u64 = digits.trim().parse().map_err(|_| invalid())?;
    Ok(Duration::from_millis(amount.saturating_mul(unit_ms)))
}

/// Integers are seconds; strings go through `parse_duration`
fn duration_from_value(field: &str, value: &Value) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Number(n) => n.as_u64().map(Duration::from_secs).ok_or_else(invalid),
        Value::String(s) => parse_duration(s).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationInput {
        Seconds(u64),
        Text(String),
    }

    match DurationInput::deserialize(deserializer)? {
        DurationInput::Seconds(secs) => Ok(Some(Duration::from_secs(secs))),
        DurationInput::Text(text) => parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Configuration manager for the bridge
///
/// Handles MongoDB connection and settings retrieval.
pub struct ConfigManager {
    /// MongoDB client instance
    client: Client,

    /// Database name where the BridgeSettings collection resides
    database_name: String,
}

impl ConfigManager {
    /// Creates a new ConfigManager and establishes MongoDB connection
    ///
    /// # Arguments
    /// * `connection_string` - MongoDB connection URI (e.g., "mongodb://localhost:27017")
    /// * `database_name` - Name of the database to use (optional, defaults to "monitoring")
    pub async fn new(
        connection_string: &str,
        database_name: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let client = Client::with_uri_str(connection_string).await?;

        // Verify connection by listing databases (lightweight operation)
        match client.list_database_names(None, None).await {
            Ok(_) => info!("Successfully connected to MongoDB"),
            Err(e) => {
                warn!("MongoDB connection verification failed: {}", e);
                return Err(ConfigError::MongoConnectionError(e));
            }
        }

        let database_name = database_name.unwrap_or("monitoring").to_string();

        Ok(ConfigManager {
            client,
            database_name,
        })
    }

    fn get_database(&self) -> Database {
        self.client.database(&self.database_name)
    }

    /// Fetches the bridge settings for a specific key
    ///
    /// Executes: `db.BridgeSettings.findOne({ key: "<key>" })`
    pub async fn load_settings(&self, key: &str) -> Result<BridgeSettings, ConfigError> {
        info!("Loading bridge settings for key: {}", key);

        let collection: Collection<BridgeSettings> =
            self.get_database().collection("BridgeSettings");

        match collection.find_one(doc! { "key": key }, None).await? {
            Some(settings) => {
                info!(
                    "Loaded settings with {} provider(s), OpenNMS at {}",
                    settings.providers.len(),
                    settings.opennms.base_url
                );

                for provider in &settings.providers {
                    info!(
                        "  {} - type: '{}', enabled: {}",
                        provider.id, provider.provider_type, provider.enabled
                    );
                }

                // Reject bad schedules now rather than at the first timer
                settings.scheduler.discovery_schedule()?;
                settings.scheduler.collection_schedule()?;

                Ok(settings)
            }
            None => {
                warn!("No settings found for key: {}", key);
                Err(ConfigError::SettingsNotFound(key.to_string()))
            }
        }
    }
}
