//! Queued notification delivery with batching, retries and rate limiting.
//!
//! Producers hand notifications to a [`NotificationService`]. A scheduler
//! loop wakes on a fixed interval, takes a bounded batch from the in-memory
//! queue and delivers it record by record through a [`transport::Transport`],
//! within minute and hour rate ceilings. Failed attempts are parked with a
//! linear backoff and retried until the record's attempt limit is reached.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐   ┌────────────┐   ┌────────────────┐   ┌───────────┐
//! │ NotificationService │──▶│ QueueStore │◀──│ BatchProcessor │──▶│ Transport │
//! └─────────────────────┘   └────────────┘   └────────────────┘   └───────────┘
//!            │                                   ▲      │
//!            ▼                                   │      ▼
//!     ┌───────────┐                     ┌────────────┐ ┌─────────────┐
//!     │ Scheduler │─────── tick ───────▶│ RateLimiter│ │ RetryPolicy │
//!     └───────────┘                     └────────────┘ └─────────────┘
//! ```
//!
//! - **One batch in flight**: the loop does not tick again until the
//!   current batch finishes
//! - **FIFO dispatch**: priority is reported but does not reorder the queue
//! - **At-least-once**: a record cancelled mid-delivery may still reach the
//!   channel; its result is discarded
//! - **Self-healing**: a transport panic counts as a failed attempt for the
//!   record being delivered; other faults inside a cycle are logged and
//!   contained

pub mod client;
pub mod error;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod transport;

pub use error::{DeliveryError, Result};
pub use service::{NotificationService, ServiceConfig};

/// Default bound on live records.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

/// Default number of records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default attempt limit per record.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default transport call timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
