//! Delivery statistics.
//!
//! Cumulative counters are maintained incrementally as records settle.
//! Queue composition is not: it is computed by scanning the store whenever
//! a snapshot is requested.

use std::{collections::BTreeMap, time::Duration};

use herald_core::models::{BatchId, Priority};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::rate_limit::RateLimitSnapshot;

/// Cumulative counters since start-up. Never decrease.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryCounters {
    /// Records delivered.
    pub total_sent: u64,
    /// Records failed permanently.
    pub total_failed: u64,
    /// Records admitted.
    pub total_queued: u64,
    /// Records cancelled.
    pub total_cancelled: u64,
    /// Failed attempts that were rescheduled.
    pub total_retries: u64,
    /// Processing cycles that faulted.
    pub scheduler_faults: u64,
    /// Processing cycles completed.
    pub batches_processed: u64,
    /// Sum of transport call durations.
    pub delivery_time: Duration,
    /// Number of transport calls measured.
    pub deliveries_timed: u64,
    /// Duration of the most recent batch.
    pub last_batch_duration: Option<Duration>,
}

/// Collects delivery counters shared between the processor and the facade.
#[derive(Debug, Default)]
pub struct StatsCollector {
    counters: RwLock<DeliveryCounters>,
}

impl StatsCollector {
    /// Creates a collector with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records admitted records.
    pub async fn record_queued(&self, count: usize) {
        self.counters.write().await.total_queued += count as u64;
    }

    /// Records a successful delivery.
    pub async fn record_sent(&self, latency: Duration) {
        let mut counters = self.counters.write().await;
        counters.total_sent += 1;
        time_delivery(&mut counters, latency);
    }

    /// Records a failed attempt that will be retried.
    pub async fn record_retry(&self, latency: Duration) {
        let mut counters = self.counters.write().await;
        counters.total_retries += 1;
        time_delivery(&mut counters, latency);
    }

    /// Records a permanent failure.
    pub async fn record_failed(&self, latency: Duration) {
        let mut counters = self.counters.write().await;
        counters.total_failed += 1;
        time_delivery(&mut counters, latency);
    }

    /// Records a cancellation.
    pub async fn record_cancelled(&self) {
        self.counters.write().await.total_cancelled += 1;
    }

    /// Records a contained scheduler fault.
    pub async fn record_fault(&self) {
        self.counters.write().await.scheduler_faults += 1;
    }

    /// Records a finished batch.
    pub async fn record_batch(&self, duration: Duration) {
        let mut counters = self.counters.write().await;
        counters.batches_processed += 1;
        counters.last_batch_duration = Some(duration);
    }

    /// Current counters.
    pub async fn counters(&self) -> DeliveryCounters {
        self.counters.read().await.clone()
    }
}

fn time_delivery(counters: &mut DeliveryCounters, latency: Duration) {
    counters.delivery_time += latency;
    counters.deliveries_timed += 1;
}

/// Point-in-time delivery statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Records delivered.
    pub total_sent: u64,
    /// Records failed permanently.
    pub total_failed: u64,
    /// Records admitted.
    pub total_queued: u64,
    /// Records cancelled.
    pub total_cancelled: u64,
    /// Failed attempts that were rescheduled.
    pub total_retries: u64,
    /// Processing cycles that faulted.
    pub scheduler_faults: u64,
    /// Processing cycles completed.
    pub batches_processed: u64,
    /// Mean transport call duration.
    pub mean_delivery_ms: Option<f64>,
    /// Duration of the most recent batch.
    pub last_batch_ms: Option<u64>,
    /// Live records in the store.
    pub queue_size: usize,
    /// Whether a batch is in flight.
    pub is_processing: bool,
    /// ID of the batch in flight.
    pub current_batch: Option<BatchId>,
    /// Rate limiter window counters.
    pub rate_limit: RateLimitSnapshot,
}

impl StatsSnapshot {
    /// Combines counters with live state.
    pub fn new(
        counters: DeliveryCounters,
        queue_size: usize,
        is_processing: bool,
        current_batch: Option<BatchId>,
        rate_limit: RateLimitSnapshot,
    ) -> Self {
        let mean_delivery_ms = (counters.deliveries_timed > 0).then(|| {
            counters.delivery_time.as_micros() as f64 / 1_000.0 / counters.deliveries_timed as f64
        });

        Self {
            total_sent: counters.total_sent,
            total_failed: counters.total_failed,
            total_queued: counters.total_queued,
            total_cancelled: counters.total_cancelled,
            total_retries: counters.total_retries,
            scheduler_faults: counters.scheduler_faults,
            batches_processed: counters.batches_processed,
            mean_delivery_ms,
            last_batch_ms: counters
                .last_batch_duration
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            queue_size,
            is_processing,
            current_batch,
            rate_limit,
        }
    }
}

/// Point-in-time composition of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatusSnapshot {
    /// Live records (pending, delayed and in flight).
    pub queue_size: usize,
    /// Configured bound.
    pub capacity: usize,
    /// Records eligible for the next batch.
    pub pending: usize,
    /// Records waiting out a retry delay.
    pub delayed: usize,
    /// Records in the current batch.
    pub in_flight: usize,
    /// Terminal records retained for queries.
    pub retained: usize,
    /// Whether a batch is in flight.
    pub is_processing: bool,
    /// ID of the batch in flight.
    pub current_batch: Option<BatchId>,
    /// Waiting records per priority.
    pub by_priority: BTreeMap<Priority, usize>,
    /// Waiting records per kind.
    pub by_kind: BTreeMap<String, usize>,
}
