//! Error types for admission, retry scheduling and aggregation.
//!
//! Admission rejections and delivery failures are expected outcomes; they are modelled as
//! errors only at the boundaries where a caller has to react to them.
use crate::admission::WindowKey;
use crate::aggregation::AggregationWindow;
use std::time::Duration;

/// Invalid configuration, reported when a component is built.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The admission limit must admit at least one request.
    #[error("admission limit must be > 0")]
    ZeroLimit,
    /// A duration that has to be positive was zero.
    #[error("{field} must be > 0")]
    ZeroDuration {
        /// Name of the offending field.
        field: &'static str,
    },
    /// The backoff cap is below its base delay.
    #[error("backoff max ({max:?}) must be >= initial delay ({initial:?})")]
    MaxBelowInitial { initial: Duration, max: Duration },
    /// At least one delivery attempt is required.
    #[error("max_attempts must be > 0")]
    ZeroAttempts,
    /// A duration exceeded its upper bound.
    #[error("{field} must be <= {max:?}")]
    TooLong {
        /// Name of the offending field.
        field: &'static str,
        max: Duration,
    },
    /// The configuration document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Parse(String),
}

/// Failure reported by an external store (usage data or retry persistence).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("write failed: {0}")]
    Write(String),
}

/// Failure reported by a delivery executor.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The receiver answered with a non-success status.
    #[error("receiver rejected delivery with status {status}")]
    Rejected { status: u16 },
    /// The request never got a response.
    #[error("transport error: {0}")]
    Transport(String),
    /// The attempt exceeded its own deadline.
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Lifecycle misuse of a background component.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// The component is stopped (or was never started).
    #[error("component is not running")]
    NotRunning,
    /// `start` was called twice without an intervening `stop`.
    #[error("component is already running")]
    AlreadyRunning,
}

/// Failure of a single aggregation pass.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("usage store error: {0}")]
    Store(#[from] StoreError),
    /// The pass exceeded its bound and was abandoned.
    #[error("{window} aggregation timed out after {elapsed:?} (limit: {limit:?})")]
    Timeout { window: AggregationWindow, elapsed: Duration, limit: Duration },
}

impl AggregationError {
    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Error returned by the admission middleware.
#[derive(thiserror::Error, Debug)]
pub enum AdmissionError<E> {
    /// The caller exhausted its window; surfaces as "too many requests".
    #[error("rate limit exceeded for {key}; retry after {retry_after:?}")]
    RateLimited { key: WindowKey, retry_after: Duration },
    /// No key could be extracted from the request.
    #[error("request carries no admission key")]
    MissingKey,
    /// The wrapped service failed.
    #[error("{0}")]
    Inner(#[source] E),
}

impl<E> AdmissionError<E> {
    /// Check if this error is a rate-limit rejection
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Suggested wait before the caller tries again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
