//! Notification outcome events.
//!
//! The delivery engine reports every disposition it makes through an
//! [`EventHandler`]. Subscribers (audit logs, dashboards, tests) observe
//! outcomes without the engine knowing about them.
//!
//! ```text
//! ┌──────────────────┐  Sent / RetryScheduled  ┌───────────────────────┐
//! │ BatchProcessor   │ ──── Failed/Cancelled ─▶│ MulticastEventHandler │
//! └──────────────────┘                         └───────────────────────┘
//!                                                        │
//!                                                        ▼
//!                                               subscribers, concurrently
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{NotificationId, Recipient};

/// Outcome events emitted by the delivery engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NotificationEvent {
    /// Transport accepted the notification.
    Sent(NotificationSentEvent),

    /// Attempt failed and another one is scheduled.
    RetryScheduled(RetryScheduledEvent),

    /// Attempts are exhausted; the notification failed permanently.
    Failed(NotificationFailedEvent),

    /// A producer withdrew the notification.
    Cancelled(NotificationCancelledEvent),
}

impl NotificationEvent {
    /// ID of the notification the event is about.
    pub fn notification_id(&self) -> NotificationId {
        match self {
            Self::Sent(event) => event.notification_id,
            Self::RetryScheduled(event) => event.notification_id,
            Self::Failed(event) => event.notification_id,
            Self::Cancelled(event) => event.notification_id,
        }
    }
}

/// Emitted when a notification was delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSentEvent {
    /// Delivered notification.
    pub notification_id: NotificationId,

    /// Destination it was delivered to.
    pub recipient: Recipient,

    /// Business event tag.
    pub kind: String,

    /// Attempt that succeeded (1-based).
    pub attempt_number: u32,

    /// Transport-assigned message identifier, if any.
    pub message_ref: Option<String>,

    /// When the transport confirmed delivery.
    pub sent_at: DateTime<Utc>,
}

/// Emitted when a failed attempt is rescheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryScheduledEvent {
    /// Notification being retried.
    pub notification_id: NotificationId,

    /// Attempt that just failed (1-based).
    pub attempt_number: u32,

    /// Error reported by the transport.
    pub error_message: String,

    /// When the next attempt becomes eligible.
    pub next_attempt_at: DateTime<Utc>,
}

/// Emitted when a notification fails permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationFailedEvent {
    /// Failed notification.
    pub notification_id: NotificationId,

    /// Destination that could not be reached.
    pub recipient: Recipient,

    /// Attempts made in total.
    pub attempts: u32,

    /// Error of the final attempt.
    pub error_message: String,

    /// When the notification was given up on.
    pub failed_at: DateTime<Utc>,
}

/// Emitted when a cancellation takes effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationCancelledEvent {
    /// Cancelled notification.
    pub notification_id: NotificationId,

    /// When the cancellation was applied.
    pub cancelled_at: DateTime<Utc>,
}

/// Subscriber side of the event system.
///
/// Handlers must not block delivery processing. Failures inside a handler
/// are the handler's to log; nothing is propagated back to the engine.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one outcome event.
    async fn handle_event(&self, event: NotificationEvent);
}

/// Handler that discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: NotificationEvent) {}
}

/// Forwards each event to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registers a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: NotificationEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    impl CountingHandler {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let count = Arc::new(AtomicUsize::new(0));
            (Self { count: count.clone() }, count)
        }
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: NotificationEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sent_event() -> NotificationEvent {
        NotificationEvent::Sent(NotificationSentEvent {
            notification_id: NotificationId::new(),
            recipient: Recipient::channel(99),
            kind: "bet_placed".to_string(),
            attempt_number: 1,
            message_ref: Some("501".to_string()),
            sent_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn no_op_handler_discards_events() {
        NoOpEventHandler::new().handle_event(sent_event()).await;
    }

    #[tokio::test]
    async fn multicast_reaches_every_subscriber() {
        let mut multicast = MulticastEventHandler::new();
        let (first, first_count) = CountingHandler::new();
        let (second, second_count) = CountingHandler::new();
        multicast.add_subscriber(Arc::new(first));
        multicast.add_subscriber(Arc::new(second));

        multicast.handle_event(sent_event()).await;

        assert_eq!(multicast.subscriber_count(), 2);
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multicast_without_subscribers_is_fine() {
        MulticastEventHandler::new().handle_event(sent_event()).await;
    }

    #[test]
    fn notification_id_is_exposed_for_every_variant() {
        let id = NotificationId::new();
        let event = NotificationEvent::Cancelled(NotificationCancelledEvent {
            notification_id: id,
            cancelled_at: Utc::now(),
        });
        assert_eq!(event.notification_id(), id);
    }
}
