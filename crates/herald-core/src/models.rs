//! Notification records, recipients and the delivery lifecycle.
//!
//! A [`NotificationRecord`] is the unit of work handed to the queue. Its
//! [`NotificationStatus`] follows a small state machine:
//!
//! ```text
//!   pending ──▶ processing ──▶ sent
//!      │  ▲          │  ──────▶ failed
//!      │  └──────────┤ (retry)
//!      ▼             ▼
//!   cancelled ◀──────┘
//! ```
//!
//! `sent`, `failed` and `cancelled` are terminal. Once a record reaches one
//! of them no further transition is accepted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HeraldError, Result};

/// Notification kind used when a producer does not supply one.
pub const DEFAULT_KIND: &str = "general";

/// Unique identifier of a notification record. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    /// Creates a new random notification ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NotificationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of one processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    /// Creates a new random batch ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Producer-assigned urgency.
///
/// Carried and reported, but the queue dispatches in FIFO order regardless
/// of priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work such as bulk sends.
    Low,
    /// Ordinary notifications.
    #[default]
    Medium,
    /// Needs prompt attention.
    High,
    /// Operator must see this now.
    Critical,
}

impl Priority {
    /// All priorities, lowest first.
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    /// Lowercase name used in logs and statistics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of a notification: exactly one of a numeric channel identity
/// or a textual handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// Numeric chat/channel identity.
    Channel(i64),
    /// Public handle, stored without the leading `@`.
    Handle(String),
}

impl Recipient {
    /// Recipient addressed by numeric channel identity.
    pub const fn channel(channel_id: i64) -> Self {
        Self::Channel(channel_id)
    }

    /// Recipient addressed by handle. A leading `@` is accepted and dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecipient` if the handle is blank or contains
    /// whitespace.
    pub fn handle(handle: impl AsRef<str>) -> Result<Self> {
        let recipient = Self::Handle(handle.as_ref().trim().trim_start_matches('@').to_string());
        recipient.validate()?;
        Ok(recipient)
    }

    /// Builds a recipient from loosely-typed input where either field may be
    /// absent, as produced by request decoding.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecipient` unless exactly one of the two is supplied.
    pub fn from_parts(channel_id: Option<i64>, handle: Option<&str>) -> Result<Self> {
        match (channel_id, handle) {
            (Some(id), None) => Ok(Self::Channel(id)),
            (None, Some(handle)) => Self::handle(handle),
            (Some(_), Some(_)) => Err(HeraldError::invalid_recipient(
                "both channel id and handle supplied; exactly one is required",
            )),
            (None, None) => {
                Err(HeraldError::invalid_recipient("neither channel id nor handle supplied"))
            },
        }
    }

    /// Checks that a directly-constructed recipient is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecipient` for a blank handle or one with whitespace.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Channel(_) => Ok(()),
            Self::Handle(handle) if handle.is_empty() => {
                Err(HeraldError::invalid_recipient("handle is empty"))
            },
            Self::Handle(handle) if handle.chars().any(char::is_whitespace) => {
                Err(HeraldError::invalid_recipient(format!("handle '{handle}' contains whitespace")))
            },
            Self::Handle(_) => Ok(()),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "{id}"),
            Self::Handle(handle) => write!(f, "@{handle}"),
        }
    }
}

/// Rich-text mode understood by the messaging channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParseMode {
    /// Legacy markdown.
    Markdown,
    /// Markdown with strict escaping.
    MarkdownV2,
    /// HTML subset.
    #[serde(rename = "HTML")]
    Html,
}

impl ParseMode {
    /// Wire name expected by the channel API.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Markdown => "Markdown",
            Self::MarkdownV2 => "MarkdownV2",
            Self::Html => "HTML",
        }
    }
}

/// Rendering hints and transport-specific options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Rich-text mode, plain text when absent.
    pub parse_mode: Option<ParseMode>,
    /// Deliver without a sound/alert on the client.
    pub disable_notification: bool,
    /// Suppress link previews.
    pub disable_web_page_preview: bool,
    /// Options passed through to the transport untouched.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Text payload with its rendering hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationContent {
    /// Message body.
    pub text: String,
    /// How the body should be rendered.
    #[serde(default)]
    pub options: RenderOptions,
}

impl NotificationContent {
    /// Plain-text content.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), options: RenderOptions::default() }
    }
}

/// Lifecycle bookkeeping for a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMetadata {
    /// When the record was admitted. Immutable.
    pub created_at: DateTime<Utc>,
    /// Earliest time the record may be handed to the transport. Immutable.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Failed delivery attempts so far. Never exceeds `max_retries`.
    pub retry_count: u32,
    /// Attempts allowed before the record fails permanently. Immutable.
    pub max_retries: u32,
    /// Time of the most recent transport call.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Error from the most recent failed transport call.
    pub last_error: Option<String>,
    /// When a record waiting out its backoff becomes eligible again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the record reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Delivery status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Waiting in the queue.
    Pending,
    /// Part of the batch currently in flight.
    Processing,
    /// Transport accepted the message.
    Sent,
    /// Every allowed attempt failed.
    Failed,
    /// Withdrawn by a producer.
    Cancelled,
}

impl NotificationStatus {
    /// Whether no further transition is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Cancelled)
                | (Self::Processing, Self::Sent | Self::Failed | Self::Pending | Self::Cancelled)
        )
    }

    /// Lowercase name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A producer's request to send one notification.
///
/// # Example
///
/// ```
/// use herald_core::models::{NewNotification, Priority, Recipient};
///
/// let request = NewNotification::new(Recipient::channel(42), "Balance updated")
///     .kind("balance_change")
///     .priority(Priority::High)
///     .max_retries(5);
/// assert_eq!(request.kind, "balance_change");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    /// Destination.
    pub recipient: Recipient,
    /// Payload.
    pub content: NotificationContent,
    /// Business event tag.
    pub kind: String,
    /// Urgency hint.
    pub priority: Priority,
    /// Hold delivery until this time.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Override of the service-wide retry limit.
    pub max_retries: Option<u32>,
}

impl NewNotification {
    /// Plain-text notification with default kind and priority.
    pub fn new(recipient: Recipient, text: impl Into<String>) -> Self {
        Self {
            recipient,
            content: NotificationContent::text(text),
            kind: DEFAULT_KIND.to_string(),
            priority: Priority::default(),
            scheduled_for: None,
            max_retries: None,
        }
    }

    /// Sets the business event tag.
    #[must_use]
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Sets the urgency hint.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Delays delivery until `at`.
    #[must_use]
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Overrides the number of attempts allowed.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Replaces rendering hints.
    #[must_use]
    pub fn render_options(mut self, options: RenderOptions) -> Self {
        self.content.options = options;
        self
    }

    /// Checks the request can be admitted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecipient`, `EmptyContent` or `InvalidRetryLimit`.
    pub fn validate(&self) -> Result<()> {
        self.recipient.validate()?;
        if self.content.text.trim().is_empty() {
            return Err(HeraldError::EmptyContent);
        }
        if let Some(max_retries @ 0) = self.max_retries {
            return Err(HeraldError::InvalidRetryLimit { max_retries });
        }
        Ok(())
    }
}

/// The unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Immutable identity.
    pub id: NotificationId,
    /// Business event tag.
    pub kind: String,
    /// Urgency hint.
    pub priority: Priority,
    /// Destination.
    pub recipient: Recipient,
    /// Payload.
    pub content: NotificationContent,
    /// Lifecycle bookkeeping.
    pub metadata: NotificationMetadata,
    /// Current status.
    pub status: NotificationStatus,
}

impl NotificationRecord {
    /// Creates a pending record from a validated request.
    ///
    /// # Errors
    ///
    /// Returns the validation error of the request.
    pub fn from_request(
        request: NewNotification,
        default_max_retries: u32,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        request.validate()?;

        Ok(Self {
            id: NotificationId::new(),
            kind: request.kind,
            priority: request.priority,
            recipient: request.recipient,
            content: request.content,
            metadata: NotificationMetadata {
                created_at,
                scheduled_for: request.scheduled_for,
                retry_count: 0,
                max_retries: request.max_retries.unwrap_or(default_max_retries.max(1)),
                last_attempt: None,
                last_error: None,
                next_attempt_at: None,
                completed_at: None,
            },
            status: NotificationStatus::Pending,
        })
    }

    /// Moves the record to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the state machine forbids it; the
    /// record is left unchanged.
    pub fn transition(&mut self, next: NotificationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(HeraldError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    /// Whether the record is held back by its schedule at `now`.
    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.metadata.scheduled_for.is_some_and(|at| at > now)
    }

    /// 1-based number of the next transport attempt.
    pub const fn attempt_number(&self) -> u32 {
        self.metadata.retry_count.saturating_add(1)
    }

    /// Whether the record reached a terminal status.
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Status of one processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Formed but not started.
    Pending,
    /// Records are being handed to the transport.
    Processing,
    /// Every record was dispositioned.
    Completed,
    /// The cycle aborted before finishing.
    Failed,
}

/// Slice of the queue pulled for one scheduler tick. Never outlives the tick.
#[derive(Debug, Clone)]
pub struct NotificationBatch {
    /// Cycle identity, reported in statistics while in flight.
    pub id: BatchId,
    /// Records owned by this cycle.
    pub messages: Vec<NotificationRecord>,
    /// Cycle status.
    pub status: BatchStatus,
    /// When the cycle was formed.
    pub created_at: DateTime<Utc>,
    /// When the cycle finished.
    pub processed_at: Option<DateTime<Utc>>,
}

impl NotificationBatch {
    /// Forms a batch from records already claimed from the queue.
    pub fn new(messages: Vec<NotificationRecord>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: BatchId::new(),
            messages,
            status: BatchStatus::Pending,
            created_at,
            processed_at: None,
        }
    }

    /// Marks the batch as started.
    pub fn begin(&mut self) {
        self.status = BatchStatus::Processing;
    }

    /// Marks the batch as finished.
    pub fn finish(&mut self, processed_at: DateTime<Utc>, aborted: bool) {
        self.status = if aborted { BatchStatus::Failed } else { BatchStatus::Completed };
        self.processed_at = Some(processed_at);
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
