// Configuration management with layered configuration (file, env)

use crate::errors::ConfigurationError;
use crate::models::RunConfig;
use crate::retry::{Backoff, ExponentialBackoff, FixedDelay, RetryPolicy};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any configured retry delay (one day)
pub const MAX_RETRY_DELAY_SECONDS: u64 = 86_400;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub s3: S3Config,
    pub redis: RedisConfig,
    pub schedule: ScheduleConfig,
    pub sensor: SensorConfig,
    pub retry: RetryConfig,
    pub executor: ExecutorConfig,
    pub seen_store: SeenStoreConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// Partitioned cron schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub name: String,
    /// Five-field cron expression
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub partitions: Vec<String>,
    /// Source key template, `{partition_key}` is substituted
    pub source_key_template: String,
    /// Step receiving the source key
    pub extract_step: String,
    /// Config field of the extract step holding the source key
    pub key_field: String,
}

/// Discovery sensor polling an S3 prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub name: String,
    pub bucket: String,
    pub prefix: String,
    pub minimum_interval_seconds: u64,
    pub poll_timeout_seconds: u64,
    #[serde(default)]
    pub max_keys: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_seconds: u64,
    pub backoff: BackoffKind,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,
    #[serde(default)]
    pub jitter_factor: f64,
}

impl RetryConfig {
    /// Build the step retry policy with the default error classification
    pub fn policy(&self) -> RetryPolicy {
        let backoff: Arc<dyn Backoff> = match self.backoff {
            BackoffKind::Fixed => Arc::new(FixedDelay::new(Duration::from_secs(self.delay_seconds))),
            BackoffKind::Exponential => Arc::new(ExponentialBackoff::with_config(
                self.delay_seconds,
                self.max_delay_seconds,
                self.jitter_factor,
            )),
        };
        RetryPolicy::new(self.max_retries, backoff)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub step_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeenStoreBackend {
    Memory,
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenStoreConfig {
    pub backend: SeenStoreBackend,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub redis_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_max_delay() -> u64 {
    300
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            // Start with built-in defaults
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("schedule.partitions"),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        fn invalid(msg: &str) -> Result<(), ConfigurationError> {
            Err(ConfigurationError::InvalidSettings(msg.to_string()))
        }

        if self.s3.endpoint.is_empty() {
            return invalid("S3 endpoint cannot be empty");
        }
        if self.s3.bucket.is_empty() {
            return invalid("S3 bucket cannot be empty");
        }
        if self.redis.host.is_empty() || self.redis.port == 0 {
            return invalid("Redis host and port must be set");
        }

        if self.schedule.enabled {
            if self.schedule.partitions.is_empty() {
                return invalid("Schedule partitions cannot be empty");
            }
            if self.schedule.extract_step.is_empty() || self.schedule.key_field.is_empty() {
                return invalid("Schedule extract_step and key_field must be set");
            }
        }

        if self.sensor.enabled {
            if self.sensor.bucket.is_empty() {
                return invalid("Sensor bucket cannot be empty");
            }
            if self.sensor.minimum_interval_seconds == 0 {
                return invalid("Sensor minimum_interval_seconds must be greater than 0");
            }
            if self.sensor.poll_timeout_seconds == 0 {
                return invalid("Sensor poll_timeout_seconds must be greater than 0");
            }
            if self.sensor.max_keys == Some(0) {
                return invalid("Sensor max_keys must be greater than 0");
            }
        }

        if self.retry.delay_seconds > MAX_RETRY_DELAY_SECONDS
            || self.retry.max_delay_seconds > MAX_RETRY_DELAY_SECONDS
        {
            return invalid("Retry delays cannot exceed one day");
        }

        if self.executor.step_timeout_seconds == 0 {
            return invalid("Executor step_timeout_seconds must be greater than 0");
        }

        match self.seen_store.backend {
            SeenStoreBackend::File if self.seen_store.path.is_none() => {
                return invalid("Seen store path is required for the file backend");
            }
            _ => {}
        }

        Ok(())
    }

    /// Static base run config: resource connection parameters shared by every run
    pub fn base_run_config(&self) -> RunConfig {
        RunConfig::new()
            .with_resource_config(
                "s3",
                json!({
                    "bucket": self.s3.bucket,
                    "access_key": self.s3.access_key,
                    "secret_key": self.s3.secret_key,
                    "endpoint_url": self.s3.endpoint,
                }),
            )
            .with_resource_config(
                "redis",
                json!({
                    "host": self.redis.host,
                    "port": self.redis.port,
                }),
            )
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            s3: S3Config {
                endpoint: "http://localstack:4566".to_string(),
                access_key: "test".to_string(),
                secret_key: "test".to_string(),
                bucket: "dagster".to_string(),
                region: "us-east-1".to_string(),
            },
            redis: RedisConfig {
                host: "redis".to_string(),
                port: 6379,
            },
            schedule: ScheduleConfig {
                enabled: true,
                name: "stock_partition_schedule".to_string(),
                cron: "0 * * * *".to_string(),
                timezone: default_timezone(),
                partitions: (1..=10).map(|n| n.to_string()).collect(),
                source_key_template: "prefix/stock_{partition_key}.csv".to_string(),
                extract_step: "get_s3_data".to_string(),
                key_field: "s3_key".to_string(),
            },
            sensor: SensorConfig {
                enabled: true,
                name: "stock_file_sensor".to_string(),
                bucket: "dagster".to_string(),
                prefix: "prefix".to_string(),
                minimum_interval_seconds: 30,
                poll_timeout_seconds: 10,
                max_keys: None,
            },
            retry: RetryConfig {
                max_retries: 10,
                delay_seconds: 1,
                backoff: BackoffKind::Fixed,
                max_delay_seconds: default_max_delay(),
                jitter_factor: 0.0,
            },
            executor: ExecutorConfig {
                step_timeout_seconds: 300,
            },
            seen_store: SeenStoreConfig {
                backend: SeenStoreBackend::File,
                path: Some(PathBuf::from("data/seen_keys.json")),
                redis_key: None,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
                tracing_endpoint: None,
            },
        }
    }
}
