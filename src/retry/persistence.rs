//! Durable record of pending retries, read during reconciliation.

use crate::error::StoreError;
use crate::retry::{ItemId, RetryItem};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Source of items that should have a timer.
///
/// The scheduler only reads; whoever records failed deliveries writes.
#[async_trait]
pub trait RetryPersistence<C>: Send + Sync + 'static {
    async fn list_pending_retries(&self) -> Result<Vec<RetryItem<C>>, StoreError>;
}

/// In-memory persistence for tests and single-process deployments.
#[derive(Debug)]
pub struct InMemoryRetryStore<C> {
    items: Arc<Mutex<HashMap<ItemId, RetryItem<C>>>>,
}

impl<C> Clone for InMemoryRetryStore<C> {
    fn clone(&self) -> Self {
        Self { items: Arc::clone(&self.items) }
    }
}

impl<C> Default for InMemoryRetryStore<C> {
    fn default() -> Self {
        Self { items: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<C> InMemoryRetryStore<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the pending record for `item.id`.
    pub fn upsert(&self, item: RetryItem<C>) {
        self.lock().insert(item.id.clone(), item);
    }

    pub fn remove(&self, id: &ItemId) -> Option<RetryItem<C>> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ItemId, RetryItem<C>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<C> RetryPersistence<C> for InMemoryRetryStore<C>
where
    C: Clone + Send + 'static,
{
    async fn list_pending_retries(&self) -> Result<Vec<RetryItem<C>>, StoreError> {
        let mut items: Vec<_> = self.lock().values().cloned().collect();
        items.sort_by(|a, b| a.not_before.cmp(&b.not_before).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};

    #[tokio::test]
    async fn lists_in_deadline_order() {
        let store = InMemoryRetryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.upsert(RetryItem::new(ItemId::new("late"), t0 + TimeDelta::minutes(10), 1u32));
        store.upsert(RetryItem::new(ItemId::new("early"), t0, 2u32));

        let ids: Vec<_> = store
            .list_pending_retries()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id.to_string())
            .collect();
        assert_eq!(ids, ["early", "late"]);

        store.remove(&ItemId::new("early"));
        assert_eq!(store.len(), 1);
    }
}
