//! Clock abstraction for the delivery engine.
//!
//! Every timestamp the engine records and every window it measures goes
//! through a [`Clock`], so the whole pipeline can be driven by virtual time
//! in tests while production uses the system clock and tokio timers.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of time for the delivery engine.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant, used for rate-limit windows and latency.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for record timestamps.
    fn now_system(&self) -> SystemTime;

    /// Suspends the caller for `duration`.
    ///
    /// Must never block the thread: production maps this to
    /// `tokio::time::sleep`, virtual clocks advance themselves and yield.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// System clock backed by `std::time` and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock that only moves when told to.
///
/// Clones share the same timeline, so a test can hand one clone to the
/// service and keep another to advance time. `sleep` advances the timeline
/// by the requested amount and yields once, which lets rate-limit stalls
/// and loop intervals complete instantly while still being observable
/// through [`ManualClock::total_slept`].
#[derive(Debug, Clone)]
pub struct ManualClock {
    offset_ns: Arc<AtomicU64>,
    slept_ns: Arc<AtomicU64>,
    origin_instant: Instant,
    origin_system: SystemTime,
}

impl ManualClock {
    /// Creates a clock starting at the current system time.
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Creates a clock whose wall-clock reading starts at `start`.
    pub fn starting_at(start: SystemTime) -> Self {
        Self {
            offset_ns: Arc::new(AtomicU64::new(0)),
            slept_ns: Arc::new(AtomicU64::new(0)),
            origin_instant: Instant::now(),
            origin_system: start,
        }
    }

    /// Moves the timeline forward.
    pub fn advance(&self, duration: Duration) {
        self.offset_ns.fetch_add(saturating_nanos(duration), Ordering::AcqRel);
    }

    /// Moves the timeline forward to `target`. Earlier targets are ignored
    /// because the monotonic reading may never go backwards.
    pub fn set_to(&self, target: SystemTime) {
        let target_offset = target.duration_since(self.origin_system).unwrap_or_default();
        self.offset_ns.fetch_max(saturating_nanos(target_offset), Ordering::AcqRel);
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }

    /// Total virtual time spent inside [`Clock::sleep`].
    pub fn total_slept(&self) -> Duration {
        Duration::from_nanos(self.slept_ns.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.origin_system + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.slept_ns.fetch_add(saturating_nanos(duration), Ordering::AcqRel);
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Convenience for tests and fixtures that need a fixed epoch offset.
pub fn epoch_plus(seconds: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::starting_at(epoch_plus(1_000));
        let start = clock.now();

        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(10));
        assert_eq!(clock.now_system(), epoch_plus(1_010));
    }

    #[test]
    fn set_to_never_goes_backwards() {
        let clock = ManualClock::starting_at(epoch_plus(1_000));

        clock.set_to(epoch_plus(1_060));
        assert_eq!(clock.elapsed(), Duration::from_secs(60));

        clock.set_to(epoch_plus(1_030));
        assert_eq!(clock.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn now_utc_matches_system_reading() {
        let clock = ManualClock::starting_at(epoch_plus(86_400));
        assert_eq!(clock.now_utc().timestamp(), 86_400);
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time_and_is_tracked() {
        let clock = ManualClock::new();

        clock.sleep(Duration::from_secs(5)).await;
        clock.sleep(Duration::from_secs(2)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(7));
        assert_eq!(clock.total_slept(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn clones_share_a_timeline() {
        let clock = ManualClock::new();
        let handle = clock.clone();

        handle.advance(Duration::from_millis(250));
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }
}
