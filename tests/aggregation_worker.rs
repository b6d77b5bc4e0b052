use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pulse_scheduler::aggregation::{
    AggregateKey, AggregateRecord, AggregationPeriod, AggregationWindow, AggregationWorker,
    InMemoryUsageStore, UsageEvent, UsageEventKind, UsageStore,
};
use pulse_scheduler::error::{AggregationError, StoreError};
use pulse_scheduler::telemetry::{AggregationEvent, ControlEvent, MemorySink};
use pulse_scheduler::{AggregationConfig, ManualClock, TokioClock};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

fn config(horizon_secs: u64) -> AggregationConfig {
    AggregationConfig { catch_up_horizon_secs: horizon_secs, ..Default::default() }
}

/// In-memory store with injectable latency and a scope that always fails.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: InMemoryUsageStore,
    latency: Arc<Mutex<Duration>>,
    broken_scope: Arc<Mutex<Option<String>>>,
}

impl FlakyStore {
    fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    fn break_scope(&self, scope: &str) {
        *self.broken_scope.lock().unwrap() = Some(scope.to_string());
    }
}

#[async_trait]
impl UsageStore for FlakyStore {
    async fn list_scopes(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_scopes().await
    }

    async fn query_raw_events(&self, scope: &str, range: Range<DateTime<Utc>>) -> Result<Vec<UsageEvent>, StoreError> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.broken_scope.lock().unwrap().as_deref() == Some(scope) {
            return Err(StoreError::Unavailable(format!("shard for {scope} offline")));
        }
        self.inner.query_raw_events(scope, range).await
    }

    async fn upsert_aggregate(&self, record: AggregateRecord) -> Result<(), StoreError> {
        self.inner.upsert_aggregate(record).await
    }

    async fn get_aggregate(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>, StoreError> {
        self.inner.get_aggregate(key).await
    }

    async fn aggregates_in_range(
        &self,
        scope: &str,
        window: AggregationWindow,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<AggregateRecord>, StoreError> {
        self.inner.aggregates_in_range(scope, window, range).await
    }
}

fn completed_windows(sink: &MemorySink) -> Vec<(AggregationWindow, DateTime<Utc>)> {
    sink.events()
        .into_iter()
        .filter_map(|event| match event {
            ControlEvent::Aggregation(AggregationEvent::PassCompleted { window, period_start, .. }) => {
                Some((window, period_start))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn rerunning_a_period_overwrites_instead_of_duplicating() {
    let store = InMemoryUsageStore::new();
    store.add_scope("p1");
    store.add_scope("p2");
    store.record_event(UsageEvent::new("p1", UsageEventKind::ParticipantLeft, 12.5, at(2024, 5, 14, 8, 15)));
    store.record_event(UsageEvent::new("p1", UsageEventKind::ParticipantLeft, 7.5, at(2024, 5, 14, 8, 45)));
    store.record_event(UsageEvent::new("p1", UsageEventKind::ParticipantLeft, 99.0, at(2024, 5, 14, 9, 0)));
    let clock = ManualClock::new(at(2024, 5, 14, 9, 2));
    let worker = AggregationWorker::builder(store.clone()).clock(clock).config(config(0)).build().unwrap();

    let period = AggregationPeriod { window: AggregationWindow::Hour, start: at(2024, 5, 14, 8, 0), end: at(2024, 5, 14, 9, 0) };
    for _ in 0..3 {
        let report = worker.run_pass(period).await.unwrap();
        assert_eq!(report.scopes, 2);
    }

    assert_eq!(store.aggregate_count(), 2);
    assert_eq!(store.upsert_count(), 6);
    let key = AggregateKey { scope: "p1".into(), window: AggregationWindow::Hour, period_start: period.start };
    let record = store.get_aggregate(&key).await.unwrap().unwrap();
    assert_eq!(record.summary.participant_minutes, 20.0, "events at the end boundary belong to the next hour");
    assert_eq!(record.period_end, period.end);
}

#[tokio::test]
async fn midnight_on_ordinary_day_adds_daily_pass_only() {
    let store = InMemoryUsageStore::new();
    store.add_scope("p1");
    let clock = ManualClock::new(at(2024, 5, 13, 23, 30));
    let sink = MemorySink::new();
    let worker = AggregationWorker::builder(store.clone())
        .clock(clock.clone())
        .config(config(0))
        .sink(sink.clone())
        .build()
        .unwrap();

    assert_eq!(worker.run_due().await, 1);
    clock.set_utc(at(2024, 5, 14, 0, 1));
    assert_eq!(worker.run_due().await, 2);

    assert_eq!(
        completed_windows(&sink),
        vec![
            (AggregationWindow::Hour, at(2024, 5, 13, 22, 0)),
            (AggregationWindow::Hour, at(2024, 5, 13, 23, 0)),
            (AggregationWindow::Day, at(2024, 5, 13, 0, 0)),
        ]
    );
}

#[tokio::test]
async fn catch_up_replays_hours_within_horizon() {
    let store = InMemoryUsageStore::new();
    store.add_scope("p1");
    let clock = ManualClock::new(at(2024, 5, 14, 9, 5));
    let worker = AggregationWorker::builder(store.clone()).clock(clock).config(config(6 * 3600)).build().unwrap();

    assert_eq!(worker.run_due().await, 6);
    let hours = store
        .aggregates_in_range("p1", AggregationWindow::Hour, at(2024, 5, 14, 0, 0)..at(2024, 5, 15, 0, 0))
        .await
        .unwrap();
    let starts: Vec<_> = hours.iter().map(|r| r.key.period_start).collect();
    assert_eq!(starts, (3..9).map(|h| at(2024, 5, 14, h, 0)).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn running_worker_cascades_into_month_at_first_of_month() {
    let store = InMemoryUsageStore::new();
    store.add_scope("p1");
    store.record_event(UsageEvent::new("p1", UsageEventKind::ApiRequest, 1.0, at(2024, 2, 10, 12, 0)));
    store.record_event(UsageEvent::new("p1", UsageEventKind::ApiRequest, 1.0, at(2024, 2, 29, 23, 15)));
    store.record_event(UsageEvent::new("p1", UsageEventKind::StorageUsed, 4.0, at(2024, 2, 29, 23, 20)));
    store.record_event(UsageEvent::new("p1", UsageEventKind::StorageUsed, 6.0, at(2024, 2, 29, 23, 40)));

    let sink = MemorySink::new();
    let worker = AggregationWorker::builder(store.clone())
        .clock(TokioClock::anchored_at(at(2024, 2, 29, 23, 30)))
        .config(config(0))
        .sink(sink.clone())
        .build()
        .unwrap();
    worker.start().unwrap();

    tokio::time::sleep(Duration::from_secs(31 * 60)).await;
    worker.stop().await;

    assert_eq!(
        completed_windows(&sink),
        vec![
            (AggregationWindow::Hour, at(2024, 2, 29, 22, 0)),
            (AggregationWindow::Hour, at(2024, 2, 29, 23, 0)),
            (AggregationWindow::Day, at(2024, 2, 29, 0, 0)),
            (AggregationWindow::Month, at(2024, 2, 1, 0, 0)),
        ]
    );

    let month = store
        .get_aggregate(&AggregateKey {
            scope: "p1".into(),
            window: AggregationWindow::Month,
            period_start: at(2024, 2, 1, 0, 0),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(month.summary.api_requests, 2);
    assert_eq!(month.summary.storage_gb, 5.0);
    assert_eq!(month.period_end, at(2024, 3, 1, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn timed_out_pass_is_retried_on_next_tick() {
    let store = FlakyStore::default();
    store.inner.add_scope("p1");
    store.set_latency(Duration::from_secs(11 * 60));
    let sink = MemorySink::new();
    let worker = AggregationWorker::builder(store.clone())
        .clock(ManualClock::new(at(2024, 5, 14, 9, 5)))
        .config(config(0))
        .sink(sink.clone())
        .build()
        .unwrap();

    let period = AggregationWindow::Hour.last_completed(at(2024, 5, 14, 9, 5));
    match worker.run_pass(period).await {
        Err(AggregationError::Timeout { window, limit, .. }) => {
            assert_eq!(window, AggregationWindow::Hour);
            assert_eq!(limit, Duration::from_secs(600));
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    assert_eq!(worker.run_due().await, 1);
    assert_eq!(worker.status().backlog, 1);
    assert_eq!(store.inner.aggregate_count(), 0);

    store.set_latency(Duration::ZERO);
    assert_eq!(worker.run_due().await, 1);
    let status = worker.status();
    assert_eq!((status.backlog, status.passes_failed, status.passes_completed), (0, 2, 1));
    assert_eq!(store.inner.aggregate_count(), 1);
    assert!(sink
        .events()
        .iter()
        .any(|event| matches!(event, ControlEvent::Aggregation(AggregationEvent::PassTimedOut { .. }))));
}

#[tokio::test]
async fn failing_scope_does_not_block_the_others() {
    let store = FlakyStore::default();
    for scope in ["a", "b", "c"] {
        store.inner.add_scope(scope);
    }
    store.break_scope("b");
    let worker = AggregationWorker::builder(store.clone())
        .clock(ManualClock::new(at(2024, 5, 14, 9, 5)))
        .config(config(0))
        .build()
        .unwrap();

    let period = AggregationWindow::Hour.last_completed(at(2024, 5, 14, 9, 5));
    let report = worker.run_pass(period).await.unwrap();
    assert_eq!(report.scopes, 2);
    assert_eq!(report.failed_scopes, vec!["b".to_string()]);
    assert_eq!(store.inner.aggregate_count(), 2);

    // The incomplete period is kept and retried.
    assert_eq!(worker.run_due().await, 1);
    assert_eq!(worker.status().backlog, 1);
}

#[tokio::test]
async fn deleted_scopes_are_skipped() {
    let store = InMemoryUsageStore::new();
    store.add_scope("live");
    store.add_scope("gone");
    store.remove_scope("gone");
    let worker = AggregationWorker::builder(store.clone())
        .clock(ManualClock::new(at(2024, 5, 14, 9, 5)))
        .config(config(0))
        .build()
        .unwrap();

    worker.run_due().await;
    assert_eq!(store.aggregate_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_pass_in_progress() {
    let store = FlakyStore::default();
    store.inner.add_scope("p1");
    store.set_latency(Duration::from_secs(120));
    let worker = AggregationWorker::builder(store.clone())
        .clock(TokioClock::anchored_at(at(2024, 5, 14, 9, 0)))
        .config(config(0))
        .build()
        .unwrap();

    worker.start().unwrap();
    assert!(worker.start().is_err());
    tokio::time::sleep(Duration::from_secs(10)).await;

    let started = tokio::time::Instant::now();
    worker.stop().await;
    assert!(started.elapsed() >= Duration::from_secs(100));
    assert_eq!(store.inner.aggregate_count(), 1);
    assert!(!worker.status().running);

    // Restartable, and a second stop is a no-op.
    store.set_latency(Duration::ZERO);
    for _ in 0..3 {
        worker.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        worker.stop().await;
        worker.stop().await;
    }
    assert_eq!(worker.status().backlog, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_does_not_wait_for_caller_owned_passes() {
    let store = FlakyStore::default();
    store.inner.add_scope("p1");
    let worker = AggregationWorker::builder(store.clone())
        .clock(TokioClock::anchored_at(at(2024, 5, 14, 9, 30)))
        .config(config(0))
        .build()
        .unwrap();
    worker.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(worker.status().passes_completed, 1);

    store.set_latency(Duration::from_secs(120));
    let caller = worker.clone();
    let period = AggregationWindow::Hour.last_completed(at(2024, 5, 14, 9, 30));
    let manual = tokio::spawn(async move { caller.run_pass(period).await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = tokio::time::Instant::now();
    worker.stop().await;
    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(!manual.is_finished());

    let report = manual.await.unwrap().unwrap();
    assert!(report.is_complete());
    assert_eq!(worker.status().passes_completed, 2);
}
