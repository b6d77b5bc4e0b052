//! Usage data model and the store the worker reads from and writes to.

use crate::aggregation::AggregationWindow;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Kinds of raw usage events recorded per scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventKind {
    /// A participant left; carries participant-minutes.
    ParticipantLeft,
    /// An egress ended; carries egress-minutes.
    EgressEnded,
    /// Point-in-time storage reading in GB.
    StorageUsed,
    /// GB transferred.
    BandwidthUsed,
    /// One API request.
    ApiRequest,
    /// Any kind not rolled up (room started, recording ready, ...).
    #[serde(other)]
    Other,
}

/// One raw usage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub scope: String,
    pub kind: UsageEventKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(scope: impl Into<String>, kind: UsageEventKind, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { scope: scope.into(), kind, value, timestamp }
    }
}

/// Totals for one scope over one period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub participant_minutes: f64,
    pub egress_minutes: f64,
    /// Mean of the storage readings in the period.
    pub storage_gb: f64,
    pub bandwidth_gb: f64,
    pub api_requests: u64,
}

impl UsageSummary {
    /// Fold raw events: sums for minutes and bandwidth, mean for storage, count for API requests.
    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a UsageEvent>,
    {
        let mut summary = Self::default();
        let mut storage_total = 0.0;
        let mut storage_samples = 0u64;
        for event in events {
            match event.kind {
                UsageEventKind::ParticipantLeft => summary.participant_minutes += event.value,
                UsageEventKind::EgressEnded => summary.egress_minutes += event.value,
                UsageEventKind::StorageUsed => {
                    storage_total += event.value;
                    storage_samples += 1;
                }
                UsageEventKind::BandwidthUsed => summary.bandwidth_gb += event.value,
                UsageEventKind::ApiRequest => summary.api_requests += 1,
                UsageEventKind::Other => {}
            }
        }
        if storage_samples > 0 {
            summary.storage_gb = storage_total / storage_samples as f64;
        }
        summary
    }
}

/// Identity of an aggregate. Writing the same key twice overwrites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub scope: String,
    pub window: AggregationWindow,
    pub period_start: DateTime<Utc>,
}

/// A computed aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub key: AggregateKey,
    pub period_end: DateTime<Utc>,
    pub summary: UsageSummary,
    pub computed_at: DateTime<Utc>,
}

/// Storage the aggregation worker depends on.
///
/// `upsert_aggregate` must replace any record with the same [`AggregateKey`]; that is what makes
/// re-running a period safe.
#[async_trait]
pub trait UsageStore: Send + Sync + 'static {
    /// Scopes (projects) to aggregate. Deleted scopes are excluded by the store.
    async fn list_scopes(&self) -> Result<Vec<String>, StoreError>;

    /// Raw events for `scope` with `range.start <= timestamp < range.end`.
    async fn query_raw_events(
        &self,
        scope: &str,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<UsageEvent>, StoreError>;

    async fn upsert_aggregate(&self, record: AggregateRecord) -> Result<(), StoreError>;

    async fn get_aggregate(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>, StoreError>;

    /// Aggregates of `window` for `scope` whose period starts inside `range`, oldest first.
    async fn aggregates_in_range(
        &self,
        scope: &str,
        window: AggregationWindow,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<AggregateRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    scopes: BTreeSet<String>,
    events: Vec<UsageEvent>,
    aggregates: BTreeMap<AggregateKey, AggregateRecord>,
}

/// In-memory [`UsageStore`]. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUsageStore {
    tables: Arc<Mutex<Tables>>,
    upserts: Arc<AtomicU64>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scope(&self, scope: impl Into<String>) {
        self.lock().scopes.insert(scope.into());
    }

    /// Mark a scope deleted; it stops being listed.
    pub fn remove_scope(&self, scope: &str) {
        self.lock().scopes.remove(scope);
    }

    pub fn record_event(&self, event: UsageEvent) {
        self.lock().events.push(event);
    }

    /// Number of distinct aggregates stored.
    pub fn aggregate_count(&self) -> usize {
        self.lock().aggregates.len()
    }

    /// Number of upserts performed, overwrites included.
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn list_scopes(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().scopes.iter().cloned().collect())
    }

    async fn query_raw_events(
        &self,
        scope: &str,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|event| event.scope == scope && range.contains(&event.timestamp))
            .cloned()
            .collect())
    }

    async fn upsert_aggregate(&self, record: AggregateRecord) -> Result<(), StoreError> {
        self.lock().aggregates.insert(record.key.clone(), record);
        self.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get_aggregate(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>, StoreError> {
        Ok(self.lock().aggregates.get(key).cloned())
    }

    async fn aggregates_in_range(
        &self,
        scope: &str,
        window: AggregationWindow,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<AggregateRecord>, StoreError> {
        Ok(self
            .lock()
            .aggregates
            .values()
            .filter(|r| r.key.scope == scope && r.key.window == window && range.contains(&r.key.period_start))
            .cloned()
            .collect())
    }
}
