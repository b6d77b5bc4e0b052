//! Seams between the scheduler and the outside world.

use crate::error::DeliveryError;
use crate::retry::{ItemId, RetryItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Performs one delivery attempt for an item.
///
/// Implementations own their transport and any per-attempt deadline. A returned error is a
/// failed attempt; whether it is retried is up to the scheduler's [`FailurePolicy`].
#[async_trait]
pub trait DeliveryExecutor<C>: Send + Sync + 'static
where
    C: Send + Sync,
{
    async fn deliver(&self, id: &ItemId, context: &C) -> Result<(), DeliveryError>;
}

/// Context handed to a [`FailurePolicy`] after a failed attempt.
#[derive(Debug)]
pub struct FailedDelivery<'a, C> {
    pub id: &'a ItemId,
    pub context: &'a C,
    pub error: &'a DeliveryError,
    pub failed_at: DateTime<Utc>,
}

/// Decides what happens after a failed attempt.
pub trait FailurePolicy<C>: Send + Sync + 'static {
    /// Return the item to schedule next, or `None` to give up.
    fn on_failure(&self, failed: &FailedDelivery<'_, C>) -> Option<RetryItem<C>>;
}

/// Never reschedules; the caller re-submits (or reconciliation picks the item up again).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReschedule;

impl<C> FailurePolicy<C> for NoReschedule {
    fn on_failure(&self, _failed: &FailedDelivery<'_, C>) -> Option<RetryItem<C>> {
        None
    }
}

/// Contexts that track their own attempt count.
pub trait DeliveryAttempts {
    /// Attempts made so far.
    fn attempts(&self) -> u32;

    fn record_attempt(&mut self);

    /// Per-item attempt limit, if the context carries one.
    fn max_attempts(&self) -> Option<u32> {
        None
    }
}
