//! Scheduler loop: drives the batch processor on a fixed interval.
//!
//! Each tick takes at most one batch and processes it to completion before
//! the loop sleeps again, so at most one batch is ever in flight. A panic in
//! the transport is charged to the record being delivered by the processor.
//! Any other error or panic inside a cycle is contained here: unfinished
//! records go back to the head of the queue and the loop carries on with the
//! next tick.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::FutureExt;
use herald_core::{
    models::{BatchId, NotificationBatch},
    time::Clock,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::DeliveryError,
    processor::{panic_message, BatchProcessor, BatchReport},
    queue::QueueStore,
    stats::StatsCollector,
};

/// Timing of the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum records per batch.
    pub batch_size: usize,
    /// Sleep between ticks.
    pub tick_interval: Duration,
    /// How long terminal records stay queryable.
    pub history_retention: Duration,
    /// How often retained history is pruned.
    pub cleanup_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            tick_interval: Duration::from_secs(1),
            history_retention: Duration::from_secs(3_600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A batch was already in flight; nothing was done.
    Busy,
    /// No record was ready.
    Idle,
    /// A batch was processed.
    Processed(BatchReport),
    /// The cycle failed and was contained.
    Faulted {
        /// What went wrong
        message: String,
        /// Records returned to the head of the queue
        recovered: usize,
    },
}

/// Clears the processing flag when a tick ends, even by unwinding.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fixed-interval driver of the batch processor.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    processor: BatchProcessor,
    store: Arc<Mutex<QueueStore>>,
    stats: Arc<StatsCollector>,
    clock: Arc<dyn Clock>,
    processing: AtomicBool,
    current_batch: RwLock<Option<BatchId>>,
}

impl Scheduler {
    /// Creates a scheduler around a processor.
    pub fn new(
        config: SchedulerConfig,
        processor: BatchProcessor,
        store: Arc<Mutex<QueueStore>>,
        stats: Arc<StatsCollector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            processor,
            store,
            stats,
            clock,
            processing: AtomicBool::new(false),
            current_batch: RwLock::new(None),
        }
    }

    /// ID of the batch in flight, if any.
    pub async fn current_batch(&self) -> Option<BatchId> {
        *self.current_batch.read().await
    }

    /// Whether a batch is in flight.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Runs one tick: takes a batch if none is in flight and processes it.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("batch already in flight, skipping tick");
            return TickOutcome::Busy;
        }
        let _guard = ProcessingGuard(&self.processing);

        let now = self.clock.now_utc();
        let records = {
            let mut store = self.store.lock().await;
            if !store.has_work(now) {
                return TickOutcome::Idle;
            }
            store.take_batch(self.config.batch_size, now)
        };
        if records.is_empty() {
            return TickOutcome::Idle;
        }

        let mut batch = NotificationBatch::new(records, now);
        batch.begin();
        *self.current_batch.write().await = Some(batch.id);

        let result = AssertUnwindSafe(self.processor.process(&batch)).catch_unwind().await;

        *self.current_batch.write().await = None;
        let finished_at = self.clock.now_utc();

        let error = match result {
            Ok(Ok(report)) => {
                batch.finish(finished_at, false);
                self.stats.record_batch(report.duration).await;
                return TickOutcome::Processed(report);
            },
            Ok(Err(error)) => error,
            Err(panic) => {
                DeliveryError::scheduler_fault(format!("panic: {}", panic_message(&*panic)))
            },
        };

        batch.finish(finished_at, true);
        let recovered = self.store.lock().await.recover_in_flight();
        self.stats.record_fault().await;
        error!(
            batch_id = %batch.id,
            recovered,
            category = %error.category(),
            error = %error,
            "notification batch faulted, in-flight records returned to queue"
        );
        TickOutcome::Faulted { message: error.to_string(), recovered }
    }

    /// Drops terminal records older than `max_age`.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let removed = self.store.lock().await.cleanup(self.clock.now_utc(), max_age);
        if removed > 0 {
            debug!(removed, "pruned retained notification history");
        }
        removed
    }

    /// Ticks until `token` is cancelled.
    ///
    /// A batch that is in flight when cancellation arrives is finished
    /// first.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            tick_interval_ms = self.config.tick_interval.as_millis(),
            "notification scheduler starting"
        );

        let mut last_cleanup: Instant = self.clock.now();
        loop {
            if token.is_cancelled() {
                break;
            }

            self.tick().await;

            let since_cleanup = self.clock.now().saturating_duration_since(last_cleanup);
            if since_cleanup >= self.config.cleanup_interval {
                self.cleanup(self.config.history_retention).await;
                last_cleanup = self.clock.now();
            }

            tokio::select! {
                () = self.clock.sleep(self.config.tick_interval) => {}
                () = token.cancelled() => break,
            }
        }

        info!("notification scheduler stopped");
    }
}
