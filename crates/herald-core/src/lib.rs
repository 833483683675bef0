//! Core domain types for the herald notification queue.
//!
//! Provides notification records and their lifecycle, the producer-facing
//! error taxonomy, outcome events and the clock abstraction. The delivery
//! crate and the binary build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{HeraldError, Result};
pub use events::{
    EventHandler, MulticastEventHandler, NoOpEventHandler, NotificationCancelledEvent,
    NotificationEvent, NotificationFailedEvent, NotificationSentEvent, RetryScheduledEvent,
};
pub use models::{
    BatchId, BatchStatus, NewNotification, NotificationBatch, NotificationContent,
    NotificationId, NotificationMetadata, NotificationRecord, NotificationStatus, ParseMode,
    Priority, Recipient, RenderOptions, DEFAULT_KIND,
};
pub use time::{Clock, ManualClock, RealClock};
