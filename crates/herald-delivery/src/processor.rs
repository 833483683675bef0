//! Batch processor: hands one batch of records to the transport.
//!
//! Records are processed sequentially, in the order they were taken from
//! the queue. For each record:
//!
//! 1. a record cancelled since it was claimed is settled as cancelled
//! 2. a record scheduled in the future goes back to the tail unchanged
//! 3. a rate-limit slot is claimed, suspending on the clock while denied
//! 4. the transport is called under a per-call timeout; a panic inside the
//!    call counts as a failed attempt for that record alone
//! 5. the outcome is settled as sent, retried or failed, unless the record
//!    was cancelled in the meantime, in which case the outcome is discarded
//!
//! One record's failure never aborts the batch. Only an internal error ends
//! the batch early; the scheduler then returns unfinished records to the
//! head of the queue.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use herald_core::{
    events::{
        EventHandler, NotificationEvent, NotificationFailedEvent, NotificationSentEvent,
        RetryScheduledEvent,
    },
    models::{BatchId, NotificationBatch, NotificationRecord, NotificationStatus},
    time::Clock,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    queue::{QueueStore, Settlement},
    rate_limit::RateLimiter,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    stats::StatsCollector,
    transport::{DeliveryReceipt, OutboundMessage, Transport},
};

/// What happened to each record of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Batch that was processed.
    pub batch_id: Option<BatchId>,
    /// Records in the batch.
    pub taken: usize,
    /// Records delivered.
    pub sent: usize,
    /// Records parked for another attempt.
    pub retried: usize,
    /// Records failed permanently.
    pub failed: usize,
    /// Records whose cancellation took effect.
    pub cancelled: usize,
    /// Scheduled records put back because they are not due.
    pub held: usize,
    /// Records returned to the head after the rate limiter stalled.
    pub returned: usize,
    /// Time spent waiting for rate-limit slots.
    pub throttled_for: Duration,
    /// Clock time the batch took.
    pub duration: Duration,
}

enum Disposition {
    Sent,
    Retried,
    Failed,
    Cancelled,
    Held,
}

/// Shortest pause between rate-limit re-checks.
const MIN_RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(1);

/// Processes batches against a transport.
#[derive(Debug)]
pub struct BatchProcessor {
    store: Arc<Mutex<QueueStore>>,
    transport: Arc<dyn Transport>,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    stats: Arc<StatsCollector>,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    delivery_timeout: Duration,
}

impl BatchProcessor {
    /// Creates a processor over shared engine state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Mutex<QueueStore>>,
        transport: Arc<dyn Transport>,
        rate_limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
        stats: Arc<StatsCollector>,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            rate_limiter,
            retry_policy,
            stats,
            event_handler,
            clock,
            delivery_timeout,
        }
    }

    /// Processes every record of `batch` in order.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` if a record is in a state the lifecycle does
    /// not allow. Records not yet settled stay in flight for the caller to
    /// recover.
    pub async fn process(&self, batch: &NotificationBatch) -> Result<BatchReport> {
        let started = self.clock.now();
        let mut report =
            BatchReport { batch_id: Some(batch.id), taken: batch.len(), ..BatchReport::default() };

        debug!(batch_id = %batch.id, batch_size = batch.len(), "processing notification batch");

        for (index, record) in batch.messages.iter().enumerate() {
            if !self.acquire_slot(record, &mut report).await? {
                let remaining =
                    batch.messages[index..].iter().map(|record| record.id).collect::<Vec<_>>();
                report.returned = self.store.lock().await.return_to_front(&remaining);
                warn!(
                    batch_id = %batch.id,
                    returned = report.returned,
                    waited_ms = report.throttled_for.as_millis(),
                    "rate limit did not clear in time, returning rest of batch to queue"
                );
                break;
            }

            match self.process_record(record.clone()).await? {
                Disposition::Sent => report.sent += 1,
                Disposition::Retried => report.retried += 1,
                Disposition::Failed => report.failed += 1,
                Disposition::Cancelled => report.cancelled += 1,
                Disposition::Held => report.held += 1,
            }
        }

        report.duration = self.clock.now().saturating_duration_since(started);
        info!(
            batch_id = %batch.id,
            sent = report.sent,
            retried = report.retried,
            failed = report.failed,
            cancelled = report.cancelled,
            held = report.held,
            returned = report.returned,
            "notification batch processed"
        );
        Ok(report)
    }

    /// Waits for a rate-limit slot unless the record will not be sent now.
    ///
    /// Returns `false` if no slot became free within the configured wait.
    async fn acquire_slot(
        &self,
        record: &NotificationRecord,
        report: &mut BatchReport,
    ) -> Result<bool> {
        if record.is_scheduled_after(self.clock.now_utc())
            || self.store.lock().await.is_cancelled(record.id)
        {
            return Ok(true);
        }

        let config = self.rate_limiter.config();
        let backoff = config.backoff.max(MIN_RATE_LIMIT_BACKOFF);
        let started = self.clock.now();
        let mut first_denial = true;
        while !self.rate_limiter.try_acquire().await {
            let waited = self.clock.now().saturating_duration_since(started);
            if waited >= config.max_wait {
                report.throttled_for += waited;
                return Ok(false);
            }
            if first_denial {
                debug!(notification_id = %record.id, "rate limit reached, waiting for a slot");
                first_denial = false;
            }
            self.clock.sleep(backoff).await;
        }

        report.throttled_for += self.clock.now().saturating_duration_since(started);
        Ok(true)
    }

    async fn process_record(&self, mut record: NotificationRecord) -> Result<Disposition> {
        let now = self.clock.now_utc();

        if self.store.lock().await.is_cancelled(record.id) {
            self.store.lock().await.settle(record);
            return Ok(Disposition::Cancelled);
        }

        if record.is_scheduled_after(now) {
            debug!(
                notification_id = %record.id,
                scheduled_for = ?record.metadata.scheduled_for,
                "notification not yet due, requeueing"
            );
            return Ok(match self.store.lock().await.requeue(record.id) {
                Settlement::Applied => Disposition::Held,
                Settlement::Discarded => Disposition::Cancelled,
            });
        }

        let started = self.clock.now();
        let result = self.deliver(&record).await;
        let latency = self.clock.now().saturating_duration_since(started);
        let finished_at = self.clock.now_utc();
        record.metadata.last_attempt = Some(finished_at);

        match result {
            Ok(receipt) => self.settle_sent(record, receipt, finished_at, latency).await,
            Err(error) => self.settle_failure(record, error, finished_at, latency).await,
        }
    }

    async fn deliver(&self, record: &NotificationRecord) -> Result<DeliveryReceipt> {
        debug!(
            notification_id = %record.id,
            attempt = record.attempt_number(),
            recipient = %record.recipient,
            "delivering notification"
        );

        let message = OutboundMessage::from(record);
        let call = AssertUnwindSafe(async { self.transport.deliver(message).await }).catch_unwind();
        match tokio::time::timeout(self.delivery_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(&*panic);
                error!(notification_id = %record.id, panic = %message, "transport panicked");
                Err(DeliveryError::transport_panic(message))
            },
            Err(_elapsed) => Err(DeliveryError::timeout(self.delivery_timeout)),
        }
    }

    async fn settle_sent(
        &self,
        mut record: NotificationRecord,
        receipt: DeliveryReceipt,
        sent_at: DateTime<Utc>,
        latency: Duration,
    ) -> Result<Disposition> {
        transition(&mut record, NotificationStatus::Sent)?;
        record.metadata.completed_at = Some(sent_at);

        let event = NotificationEvent::Sent(NotificationSentEvent {
            notification_id: record.id,
            recipient: record.recipient.clone(),
            kind: record.kind.clone(),
            attempt_number: record.attempt_number(),
            message_ref: receipt.message_ref,
            sent_at,
        });
        let id = record.id;

        if self.store.lock().await.settle(record) == Settlement::Discarded {
            debug!(notification_id = %id, "notification cancelled during delivery, result discarded");
            return Ok(Disposition::Cancelled);
        }

        self.stats.record_sent(latency).await;
        info!(notification_id = %id, latency_ms = latency.as_millis(), "notification delivered");
        self.event_handler.handle_event(event).await;
        Ok(Disposition::Sent)
    }

    async fn settle_failure(
        &self,
        mut record: NotificationRecord,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        latency: Duration,
    ) -> Result<Disposition> {
        let attempt_number = record.attempt_number();
        record.metadata.retry_count = attempt_number;
        record.metadata.last_error = Some(error.to_string());

        let decision = RetryContext::new(
            record.metadata.retry_count,
            record.metadata.max_retries,
            error.clone(),
            failed_at,
            self.retry_policy.clone(),
        )
        .decide_retry();

        let id = record.id;
        match decision {
            RetryDecision::Retry { next_attempt_at, delay } => {
                transition(&mut record, NotificationStatus::Pending)?;
                record.metadata.next_attempt_at = Some(next_attempt_at);

                if self.store.lock().await.settle(record) == Settlement::Discarded {
                    return Ok(Disposition::Cancelled);
                }

                self.stats.record_retry(latency).await;
                warn!(
                    notification_id = %id,
                    attempt = attempt_number,
                    retry_count = attempt_number,
                    next_attempt_at = %next_attempt_at,
                    delay_ms = delay.as_millis(),
                    retryable = error.is_retryable(),
                    category = %error.category(),
                    error = %error,
                    "delivery failed, retry scheduled"
                );
                self.event_handler
                    .handle_event(NotificationEvent::RetryScheduled(RetryScheduledEvent {
                        notification_id: id,
                        attempt_number,
                        error_message: error.to_string(),
                        next_attempt_at,
                    }))
                    .await;
                Ok(Disposition::Retried)
            },
            RetryDecision::GiveUp { reason } => {
                transition(&mut record, NotificationStatus::Failed)?;
                record.metadata.completed_at = Some(failed_at);
                let recipient = record.recipient.clone();

                if self.store.lock().await.settle(record) == Settlement::Discarded {
                    return Ok(Disposition::Cancelled);
                }

                self.stats.record_failed(latency).await;
                error!(
                    notification_id = %id,
                    attempts = attempt_number,
                    category = %error.category(),
                    reason = %reason,
                    "notification failed permanently"
                );
                self.event_handler
                    .handle_event(NotificationEvent::Failed(NotificationFailedEvent {
                        notification_id: id,
                        recipient,
                        attempts: attempt_number,
                        error_message: error.to_string(),
                        failed_at,
                    }))
                    .await;
                Ok(Disposition::Failed)
            },
        }
    }
}

fn transition(record: &mut NotificationRecord, next: NotificationStatus) -> Result<()> {
    record.transition(next).map_err(|e| DeliveryError::internal(e.to_string()))
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string payload".to_string()
}

#[cfg(test)]
mod tests {
    use herald_core::{
        events::NoOpEventHandler,
        models::{NewNotification, Recipient},
        time::ManualClock,
    };

    use super::*;
    use crate::{
        rate_limit::RateLimitConfig,
        transport::mock::{MockBehavior, MockTransport},
    };

    struct Harness {
        clock: ManualClock,
        store: Arc<Mutex<QueueStore>>,
        transport: Arc<MockTransport>,
        stats: Arc<StatsCollector>,
        processor: BatchProcessor,
    }

    fn harness(behavior: MockBehavior, rate_limit: RateLimitConfig) -> Harness {
        harness_with_timeout(behavior, rate_limit, Duration::from_secs(5))
    }

    fn harness_with_timeout(
        behavior: MockBehavior,
        rate_limit: RateLimitConfig,
        delivery_timeout: Duration,
    ) -> Harness {
        let clock = ManualClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(Mutex::new(QueueStore::new(100)));
        let transport = Arc::new(MockTransport::new(shared_clock.clone(), behavior));
        let stats = Arc::new(StatsCollector::new());
        let processor = BatchProcessor::new(
            store.clone(),
            transport.clone(),
            Arc::new(RateLimiter::new(rate_limit, shared_clock.clone())),
            RetryPolicy::default(),
            stats.clone(),
            Arc::new(NoOpEventHandler::new()),
            shared_clock,
            delivery_timeout,
        );
        Harness { clock, store, transport, stats, processor }
    }

    impl Harness {
        async fn enqueue(&self, request: NewNotification) -> herald_core::models::NotificationId {
            let record =
                NotificationRecord::from_request(request, 3, self.clock.now_utc()).unwrap();
            self.store.lock().await.push(record).unwrap()
        }

        async fn take(&self, limit: usize) -> NotificationBatch {
            let now = self.clock.now_utc();
            let records = self.store.lock().await.take_batch(limit, now);
            NotificationBatch::new(records, now)
        }
    }

    #[tokio::test]
    async fn delivers_each_record_in_order() {
        let h = harness(MockBehavior::Succeed, RateLimitConfig::default());
        let first = h.enqueue(NewNotification::new(Recipient::channel(1), "a")).await;
        let second = h.enqueue(NewNotification::new(Recipient::channel(2), "b")).await;

        let report = h.processor.process(&h.take(10).await).await.unwrap();

        assert_eq!(report.sent, 2);
        let order = h.transport.calls().await.iter().map(|c| c.notification_id).collect::<Vec<_>>();
        assert_eq!(order, vec![first, second]);
        assert_eq!(h.stats.counters().await.total_sent, 2);
        assert_eq!(h.store.lock().await.find(first).unwrap().status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn failure_parks_record_with_linear_delay() {
        let h = harness(MockBehavior::Fail(DeliveryError::network("down")), RateLimitConfig::default());
        let id = h.enqueue(NewNotification::new(Recipient::channel(1), "a")).await;
        let start = h.clock.now_utc();

        let report = h.processor.process(&h.take(10).await).await.unwrap();

        assert_eq!(report.retried, 1);
        let record = h.store.lock().await.find(id).unwrap();
        assert_eq!(record.status, NotificationStatus::Pending);
        assert_eq!(record.metadata.retry_count, 1);
        assert_eq!(record.metadata.last_error.as_deref(), Some("network connection failed: down"));
        assert_eq!(record.metadata.next_attempt_at, Some(start + chrono::Duration::seconds(5)));
    }

    #[tokio::test]
    async fn future_records_are_held_without_penalty() {
        let h = harness(MockBehavior::Succeed, RateLimitConfig::default());
        let later = h.clock.now_utc() + chrono::Duration::seconds(10);
        let id = h
            .enqueue(NewNotification::new(Recipient::channel(1), "a").scheduled_for(later))
            .await;

        let report = h.processor.process(&h.take(10).await).await.unwrap();

        assert_eq!(report.held, 1);
        assert_eq!(h.transport.call_count().await, 0);
        let record = h.store.lock().await.find(id).unwrap();
        assert_eq!(record.status, NotificationStatus::Pending);
        assert_eq!(record.metadata.retry_count, 0);
    }

    #[tokio::test]
    async fn denied_slot_suspends_on_the_clock() {
        let config = RateLimitConfig { per_minute: 1, ..RateLimitConfig::default() };
        let h = harness(MockBehavior::Succeed, config);
        h.enqueue(NewNotification::new(Recipient::channel(1), "a")).await;
        h.enqueue(NewNotification::new(Recipient::channel(2), "b")).await;

        let report = h.processor.process(&h.take(10).await).await.unwrap();

        assert_eq!(report.sent, 2);
        assert_eq!(report.throttled_for, Duration::from_secs(61));
        assert_eq!(h.clock.total_slept(), Duration::from_secs(61));
    }

    #[tokio::test]
    async fn exhausted_wait_returns_rest_of_batch() {
        let config = RateLimitConfig {
            per_minute: 1,
            max_wait: Duration::from_secs(5),
            ..RateLimitConfig::default()
        };
        let h = harness(MockBehavior::Succeed, config);
        h.enqueue(NewNotification::new(Recipient::channel(1), "a")).await;
        let second = h.enqueue(NewNotification::new(Recipient::channel(2), "b")).await;
        let third = h.enqueue(NewNotification::new(Recipient::channel(3), "c")).await;

        let report = h.processor.process(&h.take(10).await).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.returned, 2);
        let mut store = h.store.lock().await;
        assert_eq!(store.in_flight_len(), 0);
        let order = store.take_batch(10, h.clock.now_utc()).iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(order, vec![second, third]);
    }

    #[tokio::test]
    async fn zero_backoff_still_gives_up_after_max_wait() {
        let config = RateLimitConfig {
            per_minute: 1,
            backoff: Duration::ZERO,
            max_wait: Duration::from_secs(5),
            ..RateLimitConfig::default()
        };
        let h = harness(MockBehavior::Succeed, config);
        h.enqueue(NewNotification::new(Recipient::channel(1), "a")).await;
        h.enqueue(NewNotification::new(Recipient::channel(2), "b")).await;

        let batch = h.take(10).await;
        let report = tokio::time::timeout(Duration::from_secs(3), h.processor.process(&batch))
            .await
            .expect("stall loop must terminate")
            .unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.returned, 1);
        assert_eq!(report.throttled_for, Duration::from_secs(5));
        assert_eq!(h.clock.total_slept(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn panic_for_one_recipient_is_a_failed_attempt() {
        let behavior = MockBehavior::PanicFor(Recipient::channel(666));
        let h = harness(behavior, RateLimitConfig::default());
        let poison = h.enqueue(NewNotification::new(Recipient::channel(666), "a")).await;
        let good = h.enqueue(NewNotification::new(Recipient::channel(1), "b")).await;

        let report = h.processor.process(&h.take(10).await).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.retried, 1);
        let store = h.store.lock().await;
        assert_eq!(store.in_flight_len(), 0);
        assert_eq!(store.find(good).unwrap().status, NotificationStatus::Sent);
        let record = store.find(poison).unwrap();
        assert_eq!(record.metadata.retry_count, 1);
        assert_eq!(
            record.metadata.last_error.as_deref(),
            Some("transport panicked: mock transport panicked for 666")
        );
    }

    #[tokio::test]
    async fn hung_transport_times_out_as_failure() {
        let h = harness_with_timeout(
            MockBehavior::Hang,
            RateLimitConfig::default(),
            Duration::from_millis(20),
        );
        let id = h.enqueue(NewNotification::new(Recipient::channel(1), "a")).await;

        let report = h.processor.process(&h.take(10).await).await.unwrap();

        assert_eq!(report.retried, 1);
        let record = h.store.lock().await.find(id).unwrap();
        assert_eq!(record.metadata.last_error.as_deref(), Some("delivery timeout after 20ms"));
    }
}
