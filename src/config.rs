//! Configuration for the herald notification service.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_delivery::{
    client::ClientConfig,
    rate_limit::RateLimitConfig,
    retry::{BackoffStrategy, RetryPolicy},
    scheduler::SchedulerConfig,
    ServiceConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "herald.toml";
const ENV_PREFIX: &str = "HERALD_";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `HERALD_` (highest priority)
/// 2. Configuration file (`herald.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Only `bot_token` has no usable default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Queue
    /// Maximum live notifications.
    ///
    /// Environment variable: `HERALD_QUEUE_CAPACITY`
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum notifications per batch.
    ///
    /// Environment variable: `HERALD_BATCH_SIZE`
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Interval between scheduler ticks in milliseconds.
    ///
    /// Environment variable: `HERALD_TICK_INTERVAL_MS`
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    // Retry
    /// Default attempt limit per notification.
    ///
    /// Environment variable: `HERALD_MAX_RETRIES`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay unit of the linear backoff in milliseconds.
    ///
    /// Environment variable: `HERALD_RETRY_BASE_DELAY_MS`
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    ///
    /// Environment variable: `HERALD_RETRY_MAX_DELAY_MS`
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `HERALD_RETRY_JITTER_FACTOR`
    #[serde(default)]
    pub retry_jitter_factor: f64,

    // Rate limit
    /// Sends allowed per minute.
    ///
    /// Environment variable: `HERALD_RATE_LIMIT_PER_MINUTE`
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    /// Sends allowed per hour.
    ///
    /// Environment variable: `HERALD_RATE_LIMIT_PER_HOUR`
    #[serde(default = "default_rate_limit_per_hour")]
    pub rate_limit_per_hour: u32,
    /// Pause between rate-limit re-checks in milliseconds.
    ///
    /// Environment variable: `HERALD_RATE_LIMIT_BACKOFF_MS`
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
    /// Longest wait for a slot before the batch yields, in milliseconds.
    ///
    /// Environment variable: `HERALD_RATE_LIMIT_MAX_WAIT_MS`
    #[serde(default = "default_rate_limit_max_wait_ms")]
    pub rate_limit_max_wait_ms: u64,

    // Delivery
    /// Timeout of one transport call in seconds.
    ///
    /// Environment variable: `HERALD_DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout_seconds")]
    pub delivery_timeout_seconds: u64,
    /// How long completed notifications stay queryable, in seconds.
    ///
    /// Environment variable: `HERALD_HISTORY_RETENTION_SECONDS`
    #[serde(default = "default_history_retention_seconds")]
    pub history_retention_seconds: u64,
    /// Interval between history cleanups in seconds.
    ///
    /// Environment variable: `HERALD_CLEANUP_INTERVAL_SECONDS`
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Time allowed for the scheduler to stop, in seconds.
    ///
    /// Environment variable: `HERALD_SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    // Bot API
    /// Base URL of the bot API.
    ///
    /// Environment variable: `HERALD_BOT_API_URL`
    #[serde(default = "default_bot_api_url")]
    pub bot_api_url: String,
    /// Bot token.
    ///
    /// Environment variable: `HERALD_BOT_TOKEN`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,

    // Logging
    /// Log filter used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `HERALD_RUST_LOG`
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment
    /// variable overrides.
    pub fn load() -> Result<Self> {
        let config: Self = Self::figment().extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Convert to the delivery crate's service configuration.
    pub fn to_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            queue_capacity: self.queue_capacity,
            scheduler: SchedulerConfig {
                batch_size: self.batch_size,
                tick_interval: Duration::from_millis(self.tick_interval_ms),
                history_retention: Duration::from_secs(self.history_retention_seconds),
                cleanup_interval: Duration::from_secs(self.cleanup_interval_seconds),
            },
            retry_policy: self.to_retry_policy(),
            rate_limit: self.to_rate_limit_config(),
            delivery_timeout: Duration::from_secs(self.delivery_timeout_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Convert to bot API client configuration.
    ///
    /// Fails when no bot token is configured.
    pub fn to_client_config(&self) -> Result<ClientConfig> {
        let bot_token = self
            .bot_token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .context("bot_token is not configured (set HERALD_BOT_TOKEN)")?;

        Ok(ClientConfig {
            api_url: self.bot_api_url.trim_end_matches('/').to_string(),
            bot_token,
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        })
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Linear,
        }
    }

    /// Convert to rate limiter configuration.
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            per_minute: self.rate_limit_per_minute,
            per_hour: self.rate_limit_per_hour,
            backoff: Duration::from_millis(self.rate_limit_backoff_ms),
            max_wait: Duration::from_millis(self.rate_limit_max_wait_ms),
        }
    }

    /// Get the bot token with everything past the bot id masked for logging.
    pub fn bot_token_masked(&self) -> String {
        match self.bot_token.as_deref() {
            None | Some("") => "<unset>".to_string(),
            Some(token) => match token.split_once(':') {
                Some((bot_id, _secret)) => format!("{bot_id}:***"),
                None => "***".to_string(),
            },
        }
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be greater than 0");
        }

        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.rate_limit_per_minute == 0 || self.rate_limit_per_hour == 0 {
            anyhow::bail!("rate limits must be greater than 0");
        }

        if self.rate_limit_per_minute > self.rate_limit_per_hour {
            anyhow::bail!("rate_limit_per_minute cannot exceed rate_limit_per_hour");
        }

        if self.rate_limit_backoff_ms == 0 {
            anyhow::bail!("rate_limit_backoff_ms must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            tick_interval_ms: default_tick_interval_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter_factor: 0.0,
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_per_hour: default_rate_limit_per_hour(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            rate_limit_max_wait_ms: default_rate_limit_max_wait_ms(),
            delivery_timeout_seconds: default_delivery_timeout_seconds(),
            history_retention_seconds: default_history_retention_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            bot_api_url: default_bot_api_url(),
            bot_token: None,
            rust_log: default_log_level(),
        }
    }
}

fn default_queue_capacity() -> usize {
    herald_delivery::DEFAULT_QUEUE_CAPACITY
}

fn default_batch_size() -> usize {
    herald_delivery::DEFAULT_BATCH_SIZE
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    herald_delivery::DEFAULT_MAX_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    5000
}

fn default_retry_max_delay_ms() -> u64 {
    300_000
}

fn default_rate_limit_per_minute() -> u32 {
    30
}

fn default_rate_limit_per_hour() -> u32 {
    1000
}

fn default_rate_limit_backoff_ms() -> u64 {
    1000
}

fn default_rate_limit_max_wait_ms() -> u64 {
    65_000
}

fn default_delivery_timeout_seconds() -> u64 {
    herald_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_history_retention_seconds() -> u64 {
    3600
}

fn default_cleanup_interval_seconds() -> u64 {
    300
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

fn default_bot_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
