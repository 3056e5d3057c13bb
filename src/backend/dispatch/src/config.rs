//! Configuration management.

use serde::Deserialize;

use crate::jobs::queue::RetentionPolicy;
use crate::jobs::RetryPolicy;
use crate::jobs::WorkerPoolConfig;
use crate::lock::LockConfig;
use crate::processor::SendConfig;
use crate::telemetry::LoggingConfig;
use crate::throttle::RateLimitConfig;

/// Main engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchConfig {
    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerPoolConfig,

    /// Process-wide claim rate limit
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Per-job lease configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Retry policy applied to new jobs
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-send timeout and bulk batching
    #[serde(default)]
    pub sending: SendConfig,

    /// Retention windows for terminal jobs
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Redis configuration for the distributed backends
    #[serde(default)]
    pub redis: RedisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key prefix for queue and lease keys
    #[serde(default = "default_redis_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_redis_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_prefix() -> String {
    "rooftop:dispatch".to_string()
}

impl DispatchConfig {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("ROOFTOP").separator("__"))
            .build()?;

        let cfg: DispatchConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("ROOFTOP").separator("__"))
            .build()?;

        let cfg: DispatchConfig = config.try_deserialize()?;
        Ok(cfg)
    }
}
