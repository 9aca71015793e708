//! Process-wide configuration.
//!
//! Layered the way `ferrex-config` loads its `Config`: built-in defaults,
//! overridden by `config.toml` if present, overridden again by environment
//! variables (loaded via `dotenvy` before `std::env` is read). Every field
//! in §6's configuration table has a home here.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::BackpressurePolicy;

/// Errors loading or validating [`PipelineConfig`].
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Cap on bounded streams (per stream).
    pub maxlen: u64,
    pub backpressure: BackpressurePolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            maxlen: 1_000_000,
            backpressure: BackpressurePolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub block_ms: u64,
    pub batch_size: usize,
    pub claim_idle_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block_ms: 5_000,
            batch_size: 100,
            claim_idle_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_seconds: u64,
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 30,
            workers: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub shards: usize,
    /// Hard-expiry cutoff: `window_end + window_grace_seconds`. Must exceed
    /// `lateness_bound_seconds` or rows never actually spend time `draining`
    /// (the sweeper would hard-expire them the moment they'd otherwise enter
    /// it).
    pub window_grace_seconds: u64,
    /// How late an event may arrive, relative to `window_start` (before open)
    /// or `window_end` (after close, while `draining`), and still count.
    pub lateness_bound_seconds: u64,
    pub dedup_retention_seconds: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            window_grace_seconds: 600,
            lateness_bound_seconds: 300,
            dedup_retention_seconds: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub event_ring_capacity: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            event_ring_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub emit_on_timeout: bool,
    pub max_size: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            emit_on_timeout: false,
            max_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub optimistic_retries: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            optimistic_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/sentinel".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricalStoreConfig {
    pub base_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for HistoricalStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

/// Top-level process configuration; every section has an independent
/// default so a partial `config.toml` is always valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stream: StreamConfig,
    pub consumer: ConsumerConfig,
    pub scheduler: SchedulerConfig,
    pub correlation: CorrelationConfig,
    pub alert: AlertConfig,
    pub detection: DetectionConfig,
    pub state: StateConfig,
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub historical_store: HistoricalStoreConfig,
}

impl PipelineConfig {
    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.consumer.block_ms)
    }

    pub fn claim_idle_duration(&self) -> Duration {
        Duration::from_millis(self.consumer.claim_idle_ms)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_seconds)
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.scheduler.workers == 0 {
            return Err(ConfigLoadError::Invalid(
                "scheduler.workers must be >= 1".into(),
            ));
        }
        if self.correlation.shards == 0 {
            return Err(ConfigLoadError::Invalid(
                "correlation.shards must be >= 1".into(),
            ));
        }
        if self.database.url.is_empty() {
            return Err(ConfigLoadError::Invalid("database.url must be set".into()));
        }
        Ok(())
    }
}

/// Loads configuration from defaults, then an optional TOML file, then
/// environment variables (`.env` is read first via `dotenvy`, non-fatal if
/// absent). Fails fast (the "Fatal" error kind of §7) on an invalid result.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(config_path: Option<&Path>) -> Result<PipelineConfig, ConfigLoadError> {
        let _ = dotenvy::dotenv();

        let mut config = PipelineConfig::default();

        if let Some(path) = config_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                config = toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }

        if let Ok(url) = std::env::var("SENTINEL_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(url) = std::env::var("SENTINEL_NATS_URL") {
            config.nats.url = url;
        }
        if let Ok(url) = std::env::var("SENTINEL_HISTORICAL_STORE_URL") {
            config.historical_store.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_invalid() {
        let mut config = PipelineConfig::default();
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_shards_is_invalid() {
        let mut config = PipelineConfig::default();
        config.correlation.shards = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ConfigLoader::load(Some(Path::new("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config.scheduler.tick_seconds, 30);
    }
}
