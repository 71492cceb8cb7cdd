// query-federation-rs/src/config.rs
// Configuration loader for the federation service

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use resilience_rs::{CircuitBreakerConfig, LoggingConfig, RetryPolicy};

/// Environment variable naming the config file
pub const CONFIG_PATH_VAR: &str = "FEDERATION_CONFIG_PATH";

/// Config file read when [`CONFIG_PATH_VAR`] is unset
pub const DEFAULT_CONFIG_PATH: &str = "./config/federation.toml";

/// Prefix of environment overrides, e.g. `FEDERATION__RETRY__MAX_ATTEMPTS`
pub const ENV_PREFIX: &str = "FEDERATION";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl From<ConfigError> for resilience_rs::Error {
    fn from(err: ConfigError) -> Self {
        resilience_rs::Error::Configuration(err.to_string())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FederationConfig {
    pub logging: LoggingConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub streaming: StreamingSettings,
    pub health: HealthSettings,
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 3,
            call_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            success_threshold: self.success_threshold,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            jitter: true,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetrySettings {
    /// Policy with the default retryable kinds (timeouts, unavailable backends)
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_delays(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
            .with_exponential_base(self.exponential_base)
            .with_jitter(self.jitter)
            .with_backoff_multiplier(self.backoff_multiplier)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    pub fallback_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            default_ttl_secs: 300,
            fallback_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Sub-windows each backend's time range is split into
    pub window_count: usize,
    /// Chunks buffered between producers and the consumer
    pub channel_capacity: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            window_count: 6,
            channel_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthSettings {
    pub probe_timeout_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:9464".to_string(),
        }
    }
}

impl FederationConfig {
    /// Loads from the file named by `FEDERATION_CONFIG_PATH` (or the default
    /// path) layered under `FEDERATION__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Loads from `path`; a missing file falls back to defaults
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config: FederationConfig = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reports every invalid value at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.success_threshold == 0 {
            problems.push("circuit_breaker.success_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.call_timeout_ms == 0 {
            problems.push("circuit_breaker.call_timeout_ms must be positive".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            problems.push(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.retry.exponential_base < 1.0 {
            problems.push("retry.exponential_base must be at least 1.0".to_string());
        }
        if self.retry.backoff_multiplier <= 0.0 {
            problems.push("retry.backoff_multiplier must be positive".to_string());
        }
        if self.cache.max_entries == 0 {
            problems.push("cache.max_entries must be at least 1".to_string());
        }
        if self.streaming.window_count == 0 {
            problems.push("streaming.window_count must be at least 1".to_string());
        }
        if self.streaming.channel_capacity == 0 {
            problems.push("streaming.channel_capacity must be at least 1".to_string());
        }
        if self.metrics.enabled && self.metrics.listen_addr.parse::<SocketAddr>().is_err() {
            problems.push(format!(
                "metrics.listen_addr '{}' is not a socket address",
                self.metrics.listen_addr
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_secs)
    }

    pub fn fallback_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.fallback_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health.probe_timeout_ms)
    }
}
