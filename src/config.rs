//! Centralized application configuration.
//!
//! Single source of truth for all tunables, loaded from environment
//! variables with sensible defaults and validated up front. Each pipeline
//! process loads the full `AppConfig` at startup and hands the relevant
//! group to the component it runs.

use std::path::PathBuf;
use std::time::Duration;

use crate::bus::BusOptions;
use crate::retry::{OnExhausted, RetryPolicy};

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key,
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
        Err(_) => Ok(default),
    }
}

/// HTTP front-end configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
    pub bind_addr: String,
    /// Hard deadline for a single request.
    pub request_deadline: Duration,
    /// How often the election-window cache is refreshed from the store.
    pub window_cache_refresh: Duration,
}

impl HttpConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_parse("HTTP_PORT", 8080)?,
            bind_addr: "0.0.0.0".to_string(),
            request_deadline: Duration::from_millis(env_parse("REQUEST_DEADLINE_MS", 10_000)?),
            window_cache_refresh: Duration::from_millis(env_parse(
                "WINDOW_CACHE_REFRESH_MS",
                30_000,
            )?),
        })
    }

    pub fn default() -> Self {
        Self {
            port: 8080,
            bind_addr: "0.0.0.0".to_string(),
            request_deadline: Duration::from_secs(10),
            window_cache_refresh: Duration::from_secs(30),
        }
    }
}

/// On-disk locations of the bus and the audit & tally store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bus_path: PathBuf,
    pub tally_path: PathBuf,
}

impl StorageConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            bus_path: std::env::var("BUS_PATH")
                .unwrap_or_else(|_| "./data/bus.db".to_string())
                .into(),
            tally_path: std::env::var("TALLY_PATH")
                .unwrap_or_else(|_| "./data/tally.db".to_string())
                .into(),
        })
    }

    pub fn default() -> Self {
        Self {
            bus_path: "./data/bus.db".into(),
            tally_path: "./data/tally.db".into(),
        }
    }
}

/// Broker tuning.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub queue_max_length: u64,
    pub visibility_timeout: Duration,
    pub max_delivery_attempts: u32,
    /// How long a publisher waits for broker confirmation before giving up.
    pub publish_confirm_timeout: Duration,
}

impl BrokerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            queue_max_length: env_parse("QUEUE_MAX_LENGTH", 100_000)?,
            visibility_timeout: Duration::from_millis(env_parse("VISIBILITY_TIMEOUT_MS", 30_000)?),
            max_delivery_attempts: env_parse("MAX_DELIVERY_ATTEMPTS", 3)?,
            publish_confirm_timeout: Duration::from_millis(env_parse(
                "PUBLISH_CONFIRM_TIMEOUT_MS",
                5_000,
            )?),
        })
    }

    pub fn default() -> Self {
        Self {
            queue_max_length: 100_000,
            visibility_timeout: Duration::from_secs(30),
            max_delivery_attempts: 3,
            publish_confirm_timeout: Duration::from_secs(5),
        }
    }

    /// The options the bus itself consumes.
    pub fn bus_options(&self) -> BusOptions {
        BusOptions {
            max_length: self.queue_max_length,
            visibility_timeout: self.visibility_timeout,
            max_delivery_attempts: self.max_delivery_attempts,
        }
    }
}

/// Validation worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub count: usize,
    /// In-flight messages per worker.
    pub prefetch: u32,
    /// Per-message processing deadline; exceeding it requeues the message.
    pub message_deadline: Duration,
    /// Envelopes larger than this are rejected outright.
    pub max_envelope_bytes: usize,
    /// Re-check the election window in the worker as well as at ingestion.
    pub enforce_window: bool,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            count: env_parse("WORKER_COUNT", 4)?,
            prefetch: env_parse("WORKER_PREFETCH", 10)?,
            message_deadline: Duration::from_millis(env_parse("MESSAGE_DEADLINE_MS", 30_000)?),
            max_envelope_bytes: env_parse("MAX_ENVELOPE_BYTES", 1024)?,
            enforce_window: env_flag("ENFORCE_WINDOW_IN_WORKER", false)?,
            poll_interval: Duration::from_millis(env_parse("WORKER_POLL_INTERVAL_MS", 100)?),
        })
    }

    pub fn default() -> Self {
        Self {
            count: 4,
            prefetch: 10,
            message_deadline: Duration::from_secs(30),
            max_envelope_bytes: 1024,
            enforce_window: false,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Aggregation service configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Flush when the buffer reaches this many envelopes.
    pub batch_size: usize,
    /// Flush when this much time has passed since the first buffered
    /// envelope.
    pub batch_interval: Duration,
    pub max_retry: u32,
    pub retry_base: Duration,
    pub poll_interval: Duration,
}

impl AggregatorConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            batch_size: env_parse("BATCH_SIZE", 100)?,
            batch_interval: Duration::from_millis(env_parse("BATCH_INTERVAL_MS", 1_000)?),
            max_retry: env_parse("MAX_RETRY", 3)?,
            retry_base: Duration::from_millis(env_parse("RETRY_BASE_MS", 1_000)?),
            poll_interval: Duration::from_millis(env_parse("AGGREGATOR_POLL_INTERVAL_MS", 100)?),
        })
    }

    pub fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval: Duration::from_secs(1),
            max_retry: 3,
            retry_base: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Batch retry policy: exponential backoff, exhausted batches go to
    /// the review channel.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry,
            base_delay: self.retry_base,
            multiplier: 2.0,
            on_exhausted: OnExhausted::ToReview,
        }
    }
}

/// Credential store configuration.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Generator output file: one valid fingerprint per line.
    pub valid_credentials_path: Option<PathBuf>,
    /// Optional expiry for duplicate-attempt counters. Unset means
    /// counters are retained for the whole voting window.
    pub duplicate_count_ttl: Option<Duration>,
}

impl CredentialConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let ttl = match std::env::var("DEDUPLICATION_COUNT_TTL_MS") {
            Ok(raw) => Some(Duration::from_millis(raw.parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidValue {
                    key: "DEDUPLICATION_COUNT_TTL_MS",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?)),
            Err(_) => None,
        };
        Ok(Self {
            valid_credentials_path: std::env::var("VALID_CREDENTIALS_PATH").ok().map(Into::into),
            duplicate_count_ttl: ttl,
        })
    }

    pub fn default() -> Self {
        Self {
            valid_credentials_path: None,
            duplicate_count_ttl: None,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub aggregator: AggregatorConfig,
    pub credentials: CredentialConfig,
}

impl AppConfig {
    /// Load and validate the complete configuration from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            http: HttpConfig::load()?,
            storage: StorageConfig::load()?,
            broker: BrokerConfig::load()?,
            worker: WorkerConfig::load()?,
            aggregator: AggregatorConfig::load()?,
            credentials: CredentialConfig::load()?,
        })
    }

    /// Built-in defaults, useful for tests.
    pub fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            storage: StorageConfig::default(),
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
            aggregator: AggregatorConfig::default(),
            credentials: CredentialConfig::default(),
        }
    }
}

/// Configuration error types.
#[derive(Debug)]
pub enum ConfigError {
    /// A configuration value is invalid.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "invalid configuration for {key}: '{value}' ({reason})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = AppConfig::default();
        assert_eq!(config.aggregator.batch_size, 100);
        assert_eq!(config.aggregator.batch_interval, Duration::from_secs(1));
        assert_eq!(config.worker.prefetch, 10);
        assert_eq!(config.broker.publish_confirm_timeout, Duration::from_secs(5));
        assert_eq!(config.aggregator.max_retry, 3);
        assert_eq!(config.aggregator.retry_base, Duration::from_secs(1));
        assert_eq!(config.broker.queue_max_length, 100_000);
        assert!(config.credentials.duplicate_count_ttl.is_none());
        assert!(!config.worker.enforce_window);
    }

    #[test]
    fn retry_policy_doubles() {
        let policy = AggregatorConfig::default().retry_policy();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }
}
