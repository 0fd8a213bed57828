//! Sink Configuration
//!
//! Recognized options for the sink, their validation, and loading from a
//! YAML file with environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::BufferConfig;
use crate::retry::BackoffPolicy;

/// Nominal SQS per-message cap (256 KiB)
const DEFAULT_QUEUE_MAX_BYTES: usize = 262_144;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadError(String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Primary stream name
    pub stream_name: String,

    /// Destination region
    pub region: String,

    /// Endpoint override for local stacks
    pub custom_endpoint: Option<String>,

    /// Per-event payload cap in bytes. Events above it must not reach
    /// `store_raw_events`; the collector enforces this.
    pub max_bytes: usize,

    /// Buffer thresholds
    pub buffer: BufferConfig,

    /// Retry backoff policy
    pub backoff: BackoffPolicy,

    /// Probe sleep between liveness attempts, in milliseconds
    pub startup_check_interval_ms: u64,

    /// Per-message byte cap on the fallback queue
    pub sqs_max_bytes: usize,

    /// Fallback queue name; presence enables spill-over
    pub sqs_buffer_name: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            region: "us-east-1".to_string(),
            custom_endpoint: None,
            max_bytes: 1_000_000,
            buffer: BufferConfig::default(),
            backoff: BackoffPolicy::default(),
            startup_check_interval_ms: 1_000,
            sqs_max_bytes: DEFAULT_QUEUE_MAX_BYTES,
            sqs_buffer_name: None,
        }
    }
}

impl SinkConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `SINK_`-prefixed environment variables (`__` as section separator).
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("SINK_").split("__"));

        let config: SinkConfig = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "stream_name must be set".to_string(),
            ));
        }
        if self.region.is_empty() {
            return Err(ConfigError::ValidationError("region must be set".to_string()));
        }
        if self.max_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_bytes must be greater than 0".to_string(),
            ));
        }
        self.buffer.validate().map_err(ConfigError::ValidationError)?;
        if self.buffer.byte_limit < self.max_bytes {
            return Err(ConfigError::ValidationError(
                "buffer byte_limit must be at least max_bytes".to_string(),
            ));
        }
        self.backoff.validate().map_err(ConfigError::ValidationError)?;
        if self.startup_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "startup_check_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.sqs_max_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "sqs_max_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Probe sleep as a duration
    pub fn startup_check_interval(&self) -> Duration {
        Duration::from_millis(self.startup_check_interval_ms)
    }

    /// Whether a fallback queue is configured
    pub fn has_queue(&self) -> bool {
        self.sqs_buffer_name.is_some()
    }
}
