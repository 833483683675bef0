//! Fixed-window rate limiter for outbound messages.
//!
//! Two counters, one per minute and one per hour, each with its own window
//! start. A window resets once more than its length has passed since it
//! opened. Bursts at window boundaries are accepted: this is a fixed-window
//! limiter, not a sliding one.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use herald_core::time::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3_600);

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Messages allowed per minute window.
    pub per_minute: u32,
    /// Messages allowed per hour window.
    pub per_hour: u32,
    /// Suspension between re-checks after a denial.
    pub backoff: Duration,
    /// Longest a single record waits for a slot before the batch yields.
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 30,
            per_hour: 1_000,
            backoff: Duration::from_secs(1),
            max_wait: Duration::from_secs(65),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started_at: Instant,
}

impl Window {
    fn roll(&mut self, now: Instant, length: Duration) {
        if now.saturating_duration_since(self.started_at) > length {
            self.count = 0;
            self.started_at = now;
        }
    }
}

#[derive(Debug)]
struct Windows {
    minute: Window,
    hour: Window,
}

/// Snapshot of the current window counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    /// Messages sent in the current minute window.
    pub minute_count: u32,
    /// Ceiling of the minute window.
    pub minute_limit: u32,
    /// Messages sent in the current hour window.
    pub hour_count: u32,
    /// Ceiling of the hour window.
    pub hour_limit: u32,
}

/// Shared minute/hour limiter driven by the injected clock.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    /// Creates a limiter whose windows open now.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let window = Window { count: 0, started_at: now };
        Self { config, clock, windows: Mutex::new(Windows { minute: window, hour: window }) }
    }

    /// Limiter configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Claims a send slot if both windows have room.
    ///
    /// Returns `false` without side effects when either ceiling is reached.
    pub async fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        windows.minute.roll(now, MINUTE);
        windows.hour.roll(now, HOUR);

        if windows.minute.count >= self.config.per_minute
            || windows.hour.count >= self.config.per_hour
        {
            return false;
        }

        windows.minute.count += 1;
        windows.hour.count += 1;
        true
    }

    /// Current counters, after rolling expired windows.
    pub async fn snapshot(&self) -> RateLimitSnapshot {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        windows.minute.roll(now, MINUTE);
        windows.hour.roll(now, HOUR);

        RateLimitSnapshot {
            minute_count: windows.minute.count,
            minute_limit: self.config.per_minute,
            hour_count: windows.hour.count,
            hour_limit: self.config.per_hour,
        }
    }
}
