//! Notification service: the producer-facing facade.
//!
//! Producers enqueue, query and cancel notifications here. The service owns
//! the queue store, rate limiter, statistics and the scheduler; `start`
//! spawns the scheduler loop and `shutdown` stops it.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result as CoreResult,
    events::{EventHandler, NoOpEventHandler, NotificationCancelledEvent, NotificationEvent},
    models::{NewNotification, NotificationId, NotificationRecord, Priority, Recipient},
    time::Clock,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    processor::BatchProcessor,
    queue::QueueStore,
    rate_limit::{RateLimitConfig, RateLimiter},
    retry::RetryPolicy,
    scheduler::{Scheduler, SchedulerConfig, TickOutcome},
    stats::{QueueStatusSnapshot, StatsCollector, StatsSnapshot},
    transport::Transport,
};

/// Configuration of the notification service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Maximum live records.
    pub queue_capacity: usize,
    /// Scheduler loop settings.
    pub scheduler: SchedulerConfig,
    /// Retry and backoff settings; `max_retries` is the per-record default.
    pub retry_policy: RetryPolicy,
    /// Outbound rate ceilings.
    pub rate_limit: RateLimitConfig,
    /// Limit on a single transport call.
    pub delivery_timeout: Duration,
    /// Time allowed for the scheduler loop to stop.
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            scheduler: SchedulerConfig::default(),
            retry_policy: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            delivery_timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Producer-facing notification queue.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use herald_core::time::RealClock;
/// use herald_delivery::{
///     client::{BotApiTransport, ClientConfig},
///     NotificationService, ServiceConfig,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = BotApiTransport::new(ClientConfig {
///     bot_token: "123:abc".to_string(),
///     ..ClientConfig::default()
/// })?;
/// let service =
///     NotificationService::new(Arc::new(transport), ServiceConfig::default(), Arc::new(RealClock));
///
/// service.start().await?;
/// let id = service.send_to_channel(42, "Balance updated", Some("balance_change"), None).await?;
/// println!("{:?}", service.status(id).await);
/// service.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct NotificationService {
    config: ServiceConfig,
    store: Arc<Mutex<QueueStore>>,
    rate_limiter: Arc<RateLimiter>,
    stats: Arc<StatsCollector>,
    scheduler: Arc<Scheduler>,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationService {
    /// Creates a service that reports outcomes to nobody.
    pub fn new(transport: Arc<dyn Transport>, config: ServiceConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_event_handler(transport, config, clock, Arc::new(NoOpEventHandler::new()))
    }

    /// Creates a service that reports outcomes to `event_handler`.
    pub fn with_event_handler(
        transport: Arc<dyn Transport>,
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        let store = Arc::new(Mutex::new(QueueStore::new(config.queue_capacity)));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));
        let stats = Arc::new(StatsCollector::new());

        let processor = BatchProcessor::new(
            store.clone(),
            transport,
            rate_limiter.clone(),
            config.retry_policy.clone(),
            stats.clone(),
            event_handler.clone(),
            clock.clone(),
            config.delivery_timeout,
        );
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            processor,
            store.clone(),
            stats.clone(),
            clock.clone(),
        ));

        Self {
            config,
            store,
            rate_limiter,
            stats,
            scheduler,
            event_handler,
            clock,
            cancellation_token: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Admits one notification.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecipient`, `EmptyContent` or `InvalidRetryLimit` for
    /// a bad request and `CapacityExceeded` when the queue is full.
    pub async fn enqueue(&self, request: NewNotification) -> CoreResult<NotificationId> {
        let record = NotificationRecord::from_request(
            request,
            self.config.retry_policy.max_retries,
            self.clock.now_utc(),
        )?;
        let (kind, priority) = (record.kind.clone(), record.priority);

        let id = self.store.lock().await.push(record).inspect_err(|error| {
            warn!(error = %error, "notification rejected");
        })?;

        self.stats.record_queued(1).await;
        debug!(notification_id = %id, kind = %kind, priority = %priority, "notification queued");
        Ok(id)
    }

    /// Sends text to a numeric channel.
    ///
    /// # Errors
    ///
    /// See [`NotificationService::enqueue`].
    pub async fn send_to_channel(
        &self,
        channel_id: i64,
        text: impl Into<String>,
        kind: Option<&str>,
        priority: Option<Priority>,
    ) -> CoreResult<NotificationId> {
        self.enqueue(request(Recipient::channel(channel_id), text, kind, priority)).await
    }

    /// Sends text to a handle.
    ///
    /// # Errors
    ///
    /// See [`NotificationService::enqueue`].
    pub async fn send_to_handle(
        &self,
        handle: &str,
        text: impl Into<String>,
        kind: Option<&str>,
        priority: Option<Priority>,
    ) -> CoreResult<NotificationId> {
        let recipient = Recipient::handle(handle)?;
        self.enqueue(request(recipient, text, kind, priority)).await
    }

    /// Enqueues now; delivery waits until `scheduled_for`.
    ///
    /// # Errors
    ///
    /// See [`NotificationService::enqueue`].
    pub async fn send_scheduled(
        &self,
        channel_id: i64,
        text: impl Into<String>,
        scheduled_for: DateTime<Utc>,
        kind: Option<&str>,
    ) -> CoreResult<NotificationId> {
        let request =
            request(Recipient::channel(channel_id), text, kind, None).scheduled_for(scheduled_for);
        self.enqueue(request).await
    }

    /// Sends the same text to every recipient at low priority.
    ///
    /// All recipients are admitted or none are.
    ///
    /// # Errors
    ///
    /// Returns the first validation error, or `CapacityExceeded` if the whole
    /// set does not fit.
    pub async fn send_bulk(
        &self,
        recipients: Vec<Recipient>,
        text: impl Into<String>,
        kind: Option<&str>,
    ) -> CoreResult<Vec<NotificationId>> {
        let text = text.into();
        let now = self.clock.now_utc();
        let records = recipients
            .into_iter()
            .map(|recipient| {
                NotificationRecord::from_request(
                    request(recipient, text.clone(), kind, Some(Priority::Low)),
                    self.config.retry_policy.max_retries,
                    now,
                )
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let ids = self.store.lock().await.push_many(records).inspect_err(|error| {
            warn!(error = %error, "bulk notification rejected");
        })?;

        self.stats.record_queued(ids.len()).await;
        info!(count = ids.len(), "bulk notifications queued");
        Ok(ids)
    }

    /// Snapshot of a record, whether live or retained.
    pub async fn status(&self, id: NotificationId) -> Option<NotificationRecord> {
        self.store.lock().await.find(id)
    }

    /// Cancels a pending or in-flight record.
    ///
    /// Returns `false` for unknown records and records already sent, failed
    /// or cancelled.
    pub async fn cancel(&self, id: NotificationId) -> bool {
        let cancelled_at = self.clock.now_utc();
        let Some(record) = self.store.lock().await.cancel(id, cancelled_at) else {
            return false;
        };

        self.stats.record_cancelled().await;
        info!(notification_id = %record.id, "notification cancelled");
        self.event_handler
            .handle_event(NotificationEvent::Cancelled(NotificationCancelledEvent {
                notification_id: record.id,
                cancelled_at,
            }))
            .await;
        true
    }

    /// Delivery statistics.
    pub async fn stats(&self) -> StatsSnapshot {
        let queue_size = self.store.lock().await.len();
        StatsSnapshot::new(
            self.stats.counters().await,
            queue_size,
            self.scheduler.is_processing(),
            self.scheduler.current_batch().await,
            self.rate_limiter.snapshot().await,
        )
    }

    /// Queue composition, computed by scanning the store.
    pub async fn queue_status(&self) -> QueueStatusSnapshot {
        let current_batch = self.scheduler.current_batch().await;
        let store = self.store.lock().await;
        let breakdown = store.breakdown();

        QueueStatusSnapshot {
            queue_size: store.len(),
            capacity: store.capacity(),
            pending: store.pending_len(),
            delayed: store.delayed_len(),
            in_flight: store.in_flight_len(),
            retained: store.history_len(),
            is_processing: self.scheduler.is_processing(),
            current_batch,
            by_priority: breakdown.by_priority,
            by_kind: breakdown.by_kind,
        }
    }

    /// Drops terminal records completed more than `max_age` ago.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        self.scheduler.cleanup(max_age).await
    }

    /// Runs one scheduler tick in the caller's task.
    pub async fn tick(&self) -> TickOutcome {
        self.scheduler.tick().await
    }

    /// Spawns the scheduler loop.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the loop is already running or the
    /// service was shut down.
    pub async fn start(&self) -> Result<()> {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return Err(DeliveryError::configuration("notification service already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::configuration("notification service was shut down"));
        }

        info!(
            queue_capacity = self.config.queue_capacity,
            batch_size = self.config.scheduler.batch_size,
            "starting notification service"
        );

        let scheduler = self.scheduler.clone();
        let token = self.cancellation_token.clone();
        *handle = Some(tokio::spawn(async move { scheduler.run(token).await }));
        Ok(())
    }

    /// Stops the scheduler loop, letting an in-flight batch finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the loop does not stop within the
    /// configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_within(self.config.shutdown_timeout).await
    }

    /// Like [`NotificationService::shutdown`] with an explicit timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the loop does not stop in time.
    pub async fn shutdown_within(&self, timeout: Duration) -> Result<()> {
        info!(timeout_seconds = timeout.as_secs(), "shutting down notification service");
        self.cancellation_token.cancel();

        let Some(handle) = self.loop_handle.lock().await.take() else {
            info!("notification service was not started, shutdown completed immediately");
            return Ok(());
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                info!("notification service stopped");
                Ok(())
            },
            Ok(Err(join_error)) => {
                error!(error = %join_error, "scheduler task failed during shutdown");
                Err(DeliveryError::internal(format!("scheduler task failed: {join_error}")))
            },
            Err(_elapsed) => {
                error!(timeout_seconds = timeout.as_secs(), "scheduler did not stop in time");
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }
}

fn request(
    recipient: Recipient,
    text: impl Into<String>,
    kind: Option<&str>,
    priority: Option<Priority>,
) -> NewNotification {
    let mut request = NewNotification::new(recipient, text);
    if let Some(kind) = kind {
        request = request.kind(kind);
    }
    if let Some(priority) = priority {
        request = request.priority(priority);
    }
    request
}

#[cfg(test)]
mod tests {
    use herald_core::{error::HeraldError, time::ManualClock};

    use super::*;
    use crate::transport::mock::MockTransport;

    fn service(capacity: usize) -> NotificationService {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        NotificationService::new(
            Arc::new(MockTransport::succeeding(clock.clone())),
            ServiceConfig { queue_capacity: capacity, ..ServiceConfig::default() },
            clock,
        )
    }

    #[tokio::test]
    async fn enqueue_defaults_kind_and_priority() {
        let service = service(10);
        let id = service.send_to_channel(1, "hello", None, None).await.unwrap();

        let record = service.status(id).await.unwrap();
        assert_eq!(record.kind, "general");
        assert_eq!(record.priority, Priority::Medium);
        assert_eq!(record.metadata.max_retries, 3);
    }

    #[tokio::test]
    async fn handle_validation_fails_fast() {
        let service = service(10);
        let error = service.send_to_handle(" ", "hello", None, None).await.unwrap_err();

        assert!(matches!(error, HeraldError::InvalidRecipient { .. }));
        assert_eq!(service.queue_status().await.queue_size, 0);
    }

    #[tokio::test]
    async fn bulk_sends_are_low_priority() {
        let service = service(10);
        let ids = service
            .send_bulk(vec![Recipient::channel(1), Recipient::channel(2)], "promo", Some("promo"))
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        let status = service.queue_status().await;
        assert_eq!(status.by_priority.get(&Priority::Low), Some(&2));
        assert_eq!(status.by_kind.get("promo"), Some(&2));
        assert_eq!(service.stats().await.total_queued, 2);
    }

    #[tokio::test]
    async fn bulk_with_one_bad_recipient_admits_nothing() {
        let service = service(10);
        let result = service
            .send_bulk(vec![Recipient::channel(1), Recipient::Handle(String::new())], "x", None)
            .await;

        assert!(result.is_err());
        assert_eq!(service.queue_status().await.queue_size, 0);
    }

    #[tokio::test]
    async fn cancel_twice_returns_false_second_time() {
        let service = service(10);
        let id = service.send_to_channel(1, "x", None, None).await.unwrap();

        assert!(service.cancel(id).await);
        assert!(!service.cancel(id).await);
        assert!(!service.cancel(NotificationId::new()).await);
        assert_eq!(service.stats().await.total_cancelled, 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_shutdown_is_clean() {
        let service = service(10);
        service.start().await.unwrap();
        assert!(service.start().await.is_err());

        service.shutdown_within(Duration::from_secs(1)).await.unwrap();
        assert!(service.start().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_without_start_is_a_no_op() {
        assert!(service(10).shutdown().await.is_ok());
    }
}
