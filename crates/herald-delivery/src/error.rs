//! Error types for notification delivery.
//!
//! Covers everything past the queue boundary: transport failures reported
//! by the messaging channel, faults inside the scheduler and lifecycle
//! problems. Transport errors carry enough context to pick a log category
//! and to honour a channel-provided retry hint.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering notifications or running the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Could not reach the messaging channel.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Transport call did not complete in time.
    #[error("delivery timeout after {}ms", .timeout.as_millis())]
    Timeout {
        /// How long the call ran before it was abandoned
        timeout: Duration,
    },

    /// Channel refused the message (bad chat, blocked bot, malformed text).
    #[error("rejected by channel: HTTP {status_code}: {description}")]
    Rejected {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Channel-provided description
        description: String,
    },

    /// Channel failed internally (5xx).
    #[error("channel server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Channel asked us to slow down.
    #[error("rate limited by channel: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_seconds: u64,
    },

    /// Transport call panicked while delivering one message.
    #[error("transport panicked: {message}")]
    TransportPanic {
        /// Panic payload, if it was a string
        message: String,
    },

    /// Transport or engine misconfigured.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// A processing cycle failed unexpectedly.
    #[error("scheduler fault: {message}")]
    SchedulerFault {
        /// What went wrong inside the cycle
        message: String,
    },

    /// Scheduler loop did not stop within the allotted time.
    #[error("shutdown did not complete within {timeout_seconds}s")]
    ShutdownTimeout {
        /// Allotted seconds
        timeout_seconds: u64,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates a rejection from the channel response.
    pub fn rejected(status_code: u16, description: impl Into<String>) -> Self {
        Self::Rejected { status_code, description: description.into() }
    }

    /// Creates a server error from the channel response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a transport panic from its message.
    pub fn transport_panic(message: impl Into<String>) -> Self {
        Self::TransportPanic { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a scheduler fault.
    pub fn scheduler_fault(message: impl Into<String>) -> Self {
        Self::SchedulerFault { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether the failure is likely transient.
    ///
    /// Informational only: the queue counts every transport failure toward
    /// the retry limit regardless of kind.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. } => true,

            Self::Rejected { .. }
            | Self::TransportPanic { .. }
            | Self::ConfigurationError { .. }
            | Self::SchedulerFault { .. }
            | Self::ShutdownTimeout { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Channel-provided minimum wait before the next attempt.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Category used as a structured log field.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

/// Category of delivery error for logs and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity issues and timeouts.
    Network,
    /// Channel refused the message.
    Rejected,
    /// Channel-side failures.
    Server,
    /// Channel rate limiting.
    RateLimit,
    /// Configuration problems.
    Configuration,
    /// Scheduler and internal errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::Rejected { .. } => Self::Rejected,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::TransportPanic { .. }
            | DeliveryError::SchedulerFault { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Rejected => write!(f, "rejected"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
