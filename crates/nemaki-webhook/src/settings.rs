//! Runtime settings
//!
//! Loaded from `NEMAKI_WEBHOOK_*` environment variables (nested keys use a
//! `__` separator, e.g. `NEMAKI_WEBHOOK_BATCH__MAX_BATCH_SIZE=200`) or from a
//! settings file with environment overrides.

use crate::Result;
use ::config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Default environment prefix
pub const DEFAULT_ENV_PREFIX: &str = "NEMAKI_WEBHOOK";

/// All tunables for the webhook pipeline
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub batch: BatchSettings,
    pub dispatcher: DispatcherSettings,
    pub delivery: DeliverySettings,
}

impl WebhookSettings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_env(DEFAULT_ENV_PREFIX)
    }

    /// Load settings from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self> {
        let builder = Config::builder().add_source(env_source(prefix));

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load settings from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(path))
            .add_source(env_source(DEFAULT_ENV_PREFIX));

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }
}

fn env_source(prefix: &str) -> Environment {
    Environment::with_prefix(prefix)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Child-event batching knobs
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub batch_window_seconds: u64,
    pub max_batch_size: usize,
    /// Batch deliveries allowed per folder per rolling minute
    pub rate_limit_per_minute: usize,
    /// Folder backlog that opens the breaker
    pub circuit_breaker_threshold: usize,
    /// Cap on events handed to the delivery callback per folder per tick.
    ///
    /// Checked before each batch: while fewer events than this have been
    /// handed over, one more batch of up to `max_batch_size` goes out. A tick
    /// can therefore exceed the cap by up to one batch. With the defaults
    /// (50 and 100) each tick hands over a single batch of up to 100 events.
    pub absolute_max_per_second: usize,
    pub circuit_breaker_cooldown_seconds: u64,
    /// Idle folder slots are evicted after this many windows
    pub idle_eviction_windows: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_window_seconds: 5,
            max_batch_size: 100,
            rate_limit_per_minute: 60,
            circuit_breaker_threshold: 500,
            absolute_max_per_second: 50,
            circuit_breaker_cooldown_seconds: 60,
            idle_eviction_windows: 12,
        }
    }
}

impl BatchSettings {
    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.batch_window_seconds)
    }

    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_seconds)
    }
}

/// Outbound HTTP settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Permit loopback and private targets (local testing only)
    pub allow_private_targets: bool,
    pub user_agent: String,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            allow_private_targets: false,
            user_agent: format!("NemakiWare-Webhook/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Delivery task limits
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Concurrent deliveries in flight before new ones are rejected
    pub max_pending_deliveries: usize,
    /// Seconds `shutdown` waits for in-flight deliveries
    pub shutdown_timeout_seconds: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_pending_deliveries: 100,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl DeliverySettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}
