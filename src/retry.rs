//! Retry scheduling for failed deliveries.
//!
//! Semantics:
//! - At most one live timer per [`ItemId`]; scheduling an item again replaces its timer.
//! - A fired timer removes itself before delivery, so a stale timer can never deliver.
//! - `cancel_retry` and `stop` prevent any delivery that has not started yet; a delivery already
//!   running completes, and `stop` waits for it.
//! - Optional [`RetryPersistence`] lets the scheduler re-register pending items at start and
//!   periodically afterwards (reconciliation).
//! - On failure, a [`FailurePolicy`] decides whether the item is rescheduled. The default,
//!   [`NoReschedule`], leaves that to the caller; [`BackoffFailurePolicy`](crate::BackoffFailurePolicy)
//!   reschedules with exponential backoff up to an attempt limit.
//!
//! Example
//! ```rust
//! use async_trait::async_trait;
//! use chrono::{TimeDelta, Utc};
//! use pulse_scheduler::error::DeliveryError;
//! use pulse_scheduler::retry::{DeliveryExecutor, ItemId, RetryItem, RetryScheduler};
//!
//! struct Print;
//!
//! #[async_trait]
//! impl DeliveryExecutor<String> for Print {
//!     async fn deliver(&self, id: &ItemId, context: &String) -> Result<(), DeliveryError> {
//!         println!("delivering {id}: {context}");
//!         Ok(())
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let scheduler = RetryScheduler::builder(Print).build().unwrap();
//! scheduler.start().unwrap();
//! let item = RetryItem::new(ItemId::new("log-1"), Utc::now() + TimeDelta::minutes(5), "payload".to_string());
//! scheduler.schedule_retry(item).unwrap();
//! assert_eq!(scheduler.stats().pending, 1);
//! scheduler.stop().await;
//! # });
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod executor;
pub mod persistence;
pub mod scheduler;
pub mod webhook;

pub use executor::{DeliveryAttempts, DeliveryExecutor, FailedDelivery, FailurePolicy, NoReschedule};
pub use persistence::{InMemoryRetryStore, RetryPersistence};
pub use scheduler::{RetryScheduler, RetrySchedulerBuilder, RetryStats};
pub use webhook::WebhookDelivery;

/// Identifier of a retryable item (for webhooks, the delivery log id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<uuid::Uuid> for ItemId {
    fn from(value: uuid::Uuid) -> Self {
        Self(value.to_string())
    }
}

/// A deferred delivery: deliver `context` for `id` no earlier than `not_before`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryItem<C> {
    pub id: ItemId,
    pub not_before: DateTime<Utc>,
    pub context: C,
}

impl<C> RetryItem<C> {
    pub fn new(id: ItemId, not_before: DateTime<Utc>, context: C) -> Self {
        Self { id, not_before, context }
    }
}
