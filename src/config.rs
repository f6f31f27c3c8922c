//! Configuration management for Quotagate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{DispatchError, Result};

/// Prefix for environment variable overrides, e.g. `QUOTAGATE__LIMITER__MAX_RETRIES=3`.
const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for the dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotagateConfig {
    /// Request budget and retry policy
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Queue and transport settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Length of the rolling request window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Requests admitted per window before callers are made to wait it out
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: u32,

    /// Base delay for exponential backoff after a 429, in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Retry ceiling for throttled requests
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Floor applied to every admission delay, in milliseconds
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    /// How often a duplicate identity re-checks the pending set, in milliseconds
    #[serde(default = "default_pending_poll_interval_ms")]
    pub pending_poll_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests_per_window: default_max_requests(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retries: default_max_retries(),
            min_request_interval_ms: default_min_request_interval_ms(),
            pending_poll_interval_ms: default_pending_poll_interval_ms(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_requests() -> u32 {
    1
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    5
}

fn default_min_request_interval_ms() -> u64 {
    3000
}

fn default_pending_poll_interval_ms() -> u64 {
    3000
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Transport-level timeout for a single HTTP call, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Default caller deadline for a whole fetch (queueing and retries included)
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,

    /// Capacity of the execution queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            call_timeout_secs: None,
            queue_capacity: default_queue_capacity(),
            user_agent: default_user_agent(),
        }
    }
}

impl DispatcherConfig {
    /// Transport timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Default caller deadline as a `Duration`, if one is configured.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_user_agent() -> String {
    format!("quotagate/{}", env!("CARGO_PKG_VERSION"))
}

impl QuotagateConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotagateConfig =
            serde_yaml::from_str(yaml).map_err(|e| DispatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional YAML file, and `QUOTAGATE__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: QuotagateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.window_secs == 0 {
            return Err(DispatchError::Config("limiter.window_secs must be positive".into()));
        }
        if self.limiter.max_requests_per_window == 0 {
            return Err(DispatchError::Config(
                "limiter.max_requests_per_window must be at least 1".into(),
            ));
        }
        if self.limiter.pending_poll_interval_ms == 0 {
            return Err(DispatchError::Config(
                "limiter.pending_poll_interval_ms must be positive".into(),
            ));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(DispatchError::Config(
                "dispatcher.queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
