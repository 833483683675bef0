//! Error taxonomy for the notification queue boundary.
//!
//! These are the errors a producer can see synchronously when handing work
//! to the queue. Transport failures never surface here; they are recovered
//! by the retry policy and become visible only through record status.

use thiserror::Error;

use crate::models::NotificationStatus;

/// Result type alias using `HeraldError`.
pub type Result<T> = std::result::Result<T, HeraldError>;

/// Errors raised when creating, admitting or transitioning notifications.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeraldError {
    /// Recipient is missing, ambiguous or malformed (E1001).
    #[error("[E1001] Invalid recipient: {reason}")]
    InvalidRecipient {
        /// Why the recipient was rejected
        reason: String,
    },

    /// Notification text is empty (E1002).
    #[error("[E1002] Empty content: notification text must not be blank")]
    EmptyContent,

    /// Lifecycle transition not allowed by the state machine (E1003).
    #[error("[E1003] Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Status the record was in
        from: NotificationStatus,
        /// Status that was requested
        to: NotificationStatus,
    },

    /// Per-record attempt limit does not allow a single attempt (E1004).
    #[error("[E1004] Invalid retry limit: max_retries must be at least 1, got {max_retries}")]
    InvalidRetryLimit {
        /// Limit that was requested
        max_retries: u32,
    },

    /// Queue already holds its maximum number of records (E3001).
    #[error("[E3001] Capacity exceeded: queue is full at {capacity} notifications")]
    CapacityExceeded {
        /// Configured queue bound
        capacity: usize,
    },
}

impl HeraldError {
    /// Creates an invalid recipient error.
    pub fn invalid_recipient(reason: impl Into<String>) -> Self {
        Self::InvalidRecipient { reason: reason.into() }
    }

    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidRecipient { .. } => "E1001",
            Self::EmptyContent => "E1002",
            Self::InvalidTransition { .. } => "E1003",
            Self::InvalidRetryLimit { .. } => "E1004",
            Self::CapacityExceeded { .. } => "E3001",
        }
    }

    /// Whether the caller may succeed by trying the same request later.
    ///
    /// Only a full queue is transient; the others describe a bad request.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
