use crate::aggregation::AggregationWindow;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Events emitted by the control-plane components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Admission limiter events
    Admission(AdmissionEvent),
    /// Retry scheduler events
    Retry(RetryEvent),
    /// Aggregation worker events
    Aggregation(AggregationEvent),
}

/// Events emitted by the admission limiter's background sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// A sweep finished.
    Swept {
        /// Keys forgotten because their window emptied
        removed: usize,
        /// Keys still tracked afterwards
        tracked: usize,
    },
}

/// Events emitted by the retry scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A timer was registered for an item.
    Scheduled {
        item_id: String,
        not_before: DateTime<Utc>,
        /// Whether an earlier timer for the same item was discarded
        replaced: bool,
    },
    /// A pending timer was cancelled before firing.
    Cancelled { item_id: String },
    /// A timer fired and delivery is starting.
    Fired { item_id: String },
    /// The executor reported success.
    Delivered { item_id: String },
    /// The executor reported failure.
    DeliveryFailed { item_id: String, error: String },
    /// The failure policy asked for another attempt.
    Rescheduled { item_id: String, not_before: DateTime<Utc> },
    /// Reconciliation registered timers for persisted items.
    Reconciled {
        /// Items newly registered by this run
        registered: usize,
    },
    /// Reconciliation could not read the persistence store.
    ReconcileFailed { error: String },
}

/// Events emitted by the aggregation worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationEvent {
    /// A pass ran to completion (possibly with per-scope failures).
    PassCompleted {
        window: AggregationWindow,
        period_start: DateTime<Utc>,
        /// Scopes whose aggregate was written
        scopes: usize,
        /// Scopes that failed and were skipped
        failed_scopes: usize,
        duration: Duration,
    },
    /// A pass could not run at all.
    PassFailed { window: AggregationWindow, period_start: DateTime<Utc>, error: String },
    /// A pass exceeded its bound and was abandoned.
    PassTimedOut { window: AggregationWindow, period_start: DateTime<Utc>, limit: Duration },
}

impl ControlEvent {
    /// Structured JSON form; see [`event_to_json`].
    pub fn to_json(&self) -> serde_json::Value {
        event_to_json(self)
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEvent::Admission(event) => write!(f, "Admission::{}", event),
            ControlEvent::Retry(event) => write!(f, "Retry::{}", event),
            ControlEvent::Aggregation(event) => write!(f, "Aggregation::{}", event),
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Swept { removed, tracked } => {
                write!(f, "Swept(removed={}, tracked={})", removed, tracked)
            }
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Scheduled { item_id, not_before, replaced } => {
                write!(f, "Scheduled({}, at={}, replaced={})", item_id, not_before.to_rfc3339(), replaced)
            }
            RetryEvent::Cancelled { item_id } => write!(f, "Cancelled({})", item_id),
            RetryEvent::Fired { item_id } => write!(f, "Fired({})", item_id),
            RetryEvent::Delivered { item_id } => write!(f, "Delivered({})", item_id),
            RetryEvent::DeliveryFailed { item_id, error } => {
                write!(f, "DeliveryFailed({}, error={})", item_id, error)
            }
            RetryEvent::Rescheduled { item_id, not_before } => {
                write!(f, "Rescheduled({}, at={})", item_id, not_before.to_rfc3339())
            }
            RetryEvent::Reconciled { registered } => write!(f, "Reconciled(registered={})", registered),
            RetryEvent::ReconcileFailed { error } => write!(f, "ReconcileFailed(error={})", error),
        }
    }
}

impl fmt::Display for AggregationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationEvent::PassCompleted { window, period_start, scopes, failed_scopes, duration } => write!(
                f,
                "PassCompleted({} {}, scopes={}, failed={}, duration={:?})",
                window,
                period_start.to_rfc3339(),
                scopes,
                failed_scopes,
                duration
            ),
            AggregationEvent::PassFailed { window, period_start, error } => {
                write!(f, "PassFailed({} {}, error={})", window, period_start.to_rfc3339(), error)
            }
            AggregationEvent::PassTimedOut { window, period_start, limit } => {
                write!(f, "PassTimedOut({} {}, limit={:?})", window, period_start.to_rfc3339(), limit)
            }
        }
    }
}

fn clamp_u64(val: u128) -> u64 {
    val.min(u64::MAX as u128) as u64
}

/// Convert an event into a flat JSON object with a `kind` discriminator.
pub fn event_to_json(event: &ControlEvent) -> serde_json::Value {
    match event {
        ControlEvent::Admission(AdmissionEvent::Swept { removed, tracked }) => {
            json!({ "kind": "admission_swept", "removed": removed, "tracked": tracked })
        }
        ControlEvent::Retry(r) => match r {
            RetryEvent::Scheduled { item_id, not_before, replaced } => json!({
                "kind": "retry_scheduled",
                "item_id": item_id,
                "not_before": not_before.to_rfc3339(),
                "replaced": replaced,
            }),
            RetryEvent::Cancelled { item_id } => json!({ "kind": "retry_cancelled", "item_id": item_id }),
            RetryEvent::Fired { item_id } => json!({ "kind": "retry_fired", "item_id": item_id }),
            RetryEvent::Delivered { item_id } => json!({ "kind": "retry_delivered", "item_id": item_id }),
            RetryEvent::DeliveryFailed { item_id, error } => {
                json!({ "kind": "retry_delivery_failed", "item_id": item_id, "error": error })
            }
            RetryEvent::Rescheduled { item_id, not_before } => json!({
                "kind": "retry_rescheduled",
                "item_id": item_id,
                "not_before": not_before.to_rfc3339(),
            }),
            RetryEvent::Reconciled { registered } => {
                json!({ "kind": "retry_reconciled", "registered": registered })
            }
            RetryEvent::ReconcileFailed { error } => {
                json!({ "kind": "retry_reconcile_failed", "error": error })
            }
        },
        ControlEvent::Aggregation(a) => match a {
            AggregationEvent::PassCompleted { window, period_start, scopes, failed_scopes, duration } => json!({
                "kind": "aggregation_completed",
                "window": window.as_str(),
                "period_start": period_start.to_rfc3339(),
                "scopes": scopes,
                "failed_scopes": failed_scopes,
                "duration_ms": clamp_u64(duration.as_millis()),
            }),
            AggregationEvent::PassFailed { window, period_start, error } => json!({
                "kind": "aggregation_failed",
                "window": window.as_str(),
                "period_start": period_start.to_rfc3339(),
                "error": error,
            }),
            AggregationEvent::PassTimedOut { window, period_start, limit } => json!({
                "kind": "aggregation_timed_out",
                "window": window.as_str(),
                "period_start": period_start.to_rfc3339(),
                "limit_ms": clamp_u64(limit.as_millis()),
            }),
        },
    }
}
