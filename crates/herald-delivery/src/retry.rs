//! Retry decisions and backoff timing for failed deliveries.
//!
//! Every transport failure counts toward a record's retry limit. While the
//! limit is not reached the record is parked until `failed_at + delay`,
//! where the delay grows linearly with the number of failures by default
//! (5s, 10s, 15s, ...). A rate-limit hint from the channel acts as a floor
//! on that delay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy applied by the batch processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Default attempt limit for records that don't carry their own.
    pub max_retries: u32,

    /// Delay unit for backoff calculation.
    pub base_delay: Duration,

    /// Upper bound on the computed backoff.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Linear,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// `base * failures`.
    Linear,
    /// `base * 2^(failures - 1)`.
    Exponential,
}

/// Everything needed to decide what happens after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Failures so far, including the one being handled (1-based).
    pub failure_count: u32,
    /// Attempt limit of the record.
    pub max_retries: u32,
    /// Error that caused the failure.
    pub error: DeliveryError,
    /// When the failed attempt ended.
    pub failed_at: DateTime<Utc>,
    /// Policy to apply.
    pub policy: RetryPolicy,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the record and try again later.
    Retry {
        /// When the record becomes eligible again
        next_attempt_at: DateTime<Utc>,
        /// Delay that was applied
        delay: Duration,
    },
    /// Fail the record permanently.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryContext {
    /// Creates a retry context for a failed attempt.
    pub fn new(
        failure_count: u32,
        max_retries: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { failure_count, max_retries, error, failed_at, policy }
    }

    /// Decides whether to retry and when.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.failure_count >= self.max_retries {
            return RetryDecision::GiveUp {
                reason: format!(
                    "all {} attempts failed, last error: {}",
                    self.max_retries, self.error
                ),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay, delay }
    }

    /// Delay before the next attempt.
    pub fn calculate_delay(&self) -> Duration {
        let failures = self.failure_count.max(1);
        let backoff = match self.policy.backoff_strategy {
            BackoffStrategy::Fixed => self.policy.base_delay,
            BackoffStrategy::Linear => self.policy.base_delay.saturating_mul(failures),
            BackoffStrategy::Exponential => {
                let exponent = (failures - 1).min(20);
                self.policy.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        let capped = std::cmp::min(backoff, self.policy.max_delay);
        let jittered =
            std::cmp::min(apply_jitter(capped, self.policy.jitter_factor), self.policy.max_delay);

        match self.error.retry_after_seconds() {
            Some(seconds) => std::cmp::max(jittered, Duration::from_secs(seconds)),
            None => jittered,
        }
    }
}

/// Randomizes a delay by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}
