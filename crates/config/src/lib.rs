//! Configuration loading and validation for the Courier message bus.
//!
//! Loads a TOML file with serde defaults for every field, applies
//! environment variable overrides, and validates all settings before a bus
//! is built from them. A missing file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root bus configuration.
///
/// Maps directly to a `courier.toml` file. Every field has a default, so an
/// empty file (or no file at all) produces a working bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Delivery loop and policy settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Defaults for queues created without explicit options
    #[serde(default)]
    pub queue: QueueConfig,

    /// Per-subscription circuit breaker settings
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Signal hub buffer capacity
    #[serde(default = "default_signal_buffer")]
    pub signal_buffer: usize,
}

/// How messages are delivered: loop cadence, budget, and duplicate policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Delivery loop tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Maximum dispatches per tick across all subscriptions
    #[serde(default = "default_dispatch_budget")]
    pub dispatch_budget: usize,

    /// Duplicate handling: at-least-once redelivers, exactly-once dedups
    #[serde(default)]
    pub policy: DeliveryPolicy,

    /// Recent-hash window size for exactly-once dedup (bounded FIFO)
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,

    /// Retry budget applied to messages published without one
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Default request/reply timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Default subscription concurrency cap
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,
}

/// Whether duplicate publishes of identical content are suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Duplicates are delivered; consumers must tolerate redelivery
    #[default]
    AtLeastOnce,
    /// Publishes with a recently-seen content hash are dropped
    ExactlyOnce,
}

/// Defaults for queues created without explicit options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued (non-acknowledged) messages per queue
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// Maximum retained dead-letters per queue (oldest evicted first)
    #[serde(default = "default_max_dead_letter")]
    pub max_dead_letter: usize,
}

/// Circuit breaker tuning shared by every subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close it again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long an open breaker rejects before allowing a trial call, in ms
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    10
}
fn default_dispatch_budget() -> usize {
    64
}
fn default_dedup_window() -> usize {
    1024
}
fn default_max_retries() -> u32 {
    3
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_max_concurrent() -> usize {
    8
}
fn default_queue_max_size() -> usize {
    1_000
}
fn default_max_dead_letter() -> usize {
    100
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_breaker_timeout_ms() -> u64 {
    30_000
}
fn default_signal_buffer() -> usize {
    256
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            dispatch_budget: default_dispatch_budget(),
            policy: DeliveryPolicy::default(),
            dedup_window: default_dedup_window(),
            default_max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            default_max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            max_dead_letter: default_max_dead_letter(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryConfig::default(),
            queue: QueueConfig::default(),
            breaker: BreakerConfig::default(),
            signal_buffer: default_signal_buffer(),
        }
    }
}

impl BusConfig {
    /// Load configuration from a file path, with environment overrides.
    ///
    /// Overrides checked (highest priority):
    /// - `COURIER_TICK_INTERVAL_MS`
    /// - `COURIER_DELIVERY_POLICY` (`at_least_once` / `exactly_once`)
    /// - `COURIER_DISPATCH_BUDGET`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;

        if let Ok(tick) = std::env::var("COURIER_TICK_INTERVAL_MS") {
            config.delivery.tick_interval_ms =
                tick.parse().map_err(|_| ConfigError::ValidationError(
                    format!("COURIER_TICK_INTERVAL_MS is not a number: {tick}"),
                ))?;
        }

        if let Ok(policy) = std::env::var("COURIER_DELIVERY_POLICY") {
            config.delivery.policy = match policy.as_str() {
                "at_least_once" => DeliveryPolicy::AtLeastOnce,
                "exactly_once" => DeliveryPolicy::ExactlyOnce,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "COURIER_DELIVERY_POLICY must be at_least_once or exactly_once, got {other}"
                    )));
                }
            };
        }

        if let Ok(budget) = std::env::var("COURIER_DISPATCH_BUDGET") {
            config.delivery.dispatch_budget =
                budget.parse().map_err(|_| ConfigError::ValidationError(
                    format!("COURIER_DISPATCH_BUDGET is not a number: {budget}"),
                ))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::ParseError {
                path: PathBuf::from("<inline>"),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "delivery.tick_interval_ms must be > 0".into(),
            ));
        }
        if self.delivery.dispatch_budget == 0 {
            return Err(ConfigError::ValidationError(
                "delivery.dispatch_budget must be > 0".into(),
            ));
        }
        if self.delivery.dedup_window == 0 {
            return Err(ConfigError::ValidationError(
                "delivery.dedup_window must be > 0".into(),
            ));
        }
        if self.delivery.default_max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "delivery.default_max_concurrent must be > 0".into(),
            ));
        }
        if self.queue.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "queue.max_size must be > 0".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "breaker.failure_threshold must be > 0".into(),
            ));
        }
        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "breaker.success_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for courier_core::Error {
    fn from(err: ConfigError) -> Self {
        courier_core::Error::Config {
            message: err.to_string(),
        }
    }
}
