use crate::aggregation::schedule::boundaries_due;
use crate::aggregation::{
    AggregateKey, AggregateRecord, AggregationPeriod, AggregationWindow, UsageStore, UsageSummary,
};
use crate::clock::{SystemClock, WallClock};
use crate::config::AggregationConfig;
use crate::error::{AggregationError, ConfigError, SchedulerError, StoreError};
use crate::telemetry::{emit_best_effort, AggregationEvent, ControlEvent, NullSink, TelemetrySink};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Most failed periods kept for retry; the oldest are dropped beyond this.
pub const MAX_BACKLOG: usize = 256;

/// Outcome of one aggregation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub period: AggregationPeriod,
    /// Scopes whose aggregate was written.
    pub scopes: usize,
    pub failed_scopes: Vec<String>,
    pub duration: Duration,
}

impl PassReport {
    pub fn is_complete(&self) -> bool {
        self.failed_scopes.is_empty()
    }
}

/// Snapshot of worker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    /// Effective time of the last scheduling tick.
    pub last_run: Option<DateTime<Utc>>,
    pub passes_completed: u64,
    pub passes_failed: u64,
    /// Periods waiting to be retried on the next tick.
    pub backlog: usize,
}

/// Periodic, boundary-aligned usage rollup.
///
/// One pass runs at a time. Each pass is bounded by its window's timeout; a pass that fails or
/// times out is retried on the next tick. Must be started from within a tokio runtime.
pub struct AggregationWorker<S = NullSink> {
    inner: Arc<WorkerInner<S>>,
}

impl<S> Clone for AggregationWorker<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S> std::fmt::Debug for AggregationWorker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("AggregationWorker")
            .field("running", &state.running)
            .field("last_run", &state.last_run)
            .field("backlog", &state.backlog.len())
            .finish_non_exhaustive()
    }
}

struct WorkerInner<S> {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn WallClock>,
    config: AggregationConfig,
    sink: S,
    pass_lock: tokio::sync::Mutex<()>,
    state: Mutex<WorkerState>,
}

#[derive(Default)]
struct WorkerState {
    running: bool,
    last_run: Option<DateTime<Utc>>,
    backlog: Vec<AggregationPeriod>,
    passes_completed: u64,
    passes_failed: u64,
    runner: Option<Runner>,
}

struct Runner {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AggregationWorker<NullSink> {
    pub fn builder<U>(store: U) -> AggregationWorkerBuilder<NullSink>
    where
        U: UsageStore,
    {
        AggregationWorkerBuilder {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            config: AggregationConfig::default(),
            sink: NullSink,
        }
    }
}

impl<S> AggregationWorker<S>
where
    S: TelemetrySink,
{
    /// Run the catch-up pass, then aggregate at every hour boundary until stopped.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.inner.lock_state();
        if state.runner.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(Arc::downgrade(&self.inner), shutdown_rx));
        state.runner = Some(Runner { shutdown, task });
        state.running = true;
        info!(target: "pulse_scheduler::aggregation", "aggregation worker started");
        Ok(())
    }

    /// Signal the loop to exit and wait for it. A pass in progress finishes (or times out) first.
    ///
    /// Only the loop's own passes are awaited. A [`run_due`](Self::run_due) or
    /// [`run_pass`](Self::run_pass) call made by the caller keeps running until that call returns.
    pub async fn stop(&self) {
        let runner = {
            let mut state = self.inner.lock_state();
            state.running = false;
            state.runner.take()
        };
        let Some(runner) = runner else {
            return;
        };
        let _ = runner.shutdown.send(true);
        let _ = runner.task.await;
        info!(target: "pulse_scheduler::aggregation", "aggregation worker stopped");
    }

    /// Run every period that is due now (backlog first), as a scheduled tick would.
    ///
    /// Passes are serialized with the loop's, but the call is owned by the caller: `stop` does
    /// not wait for it. Returns the number of passes attempted.
    pub async fn run_due(&self) -> usize {
        self.inner.run_due(None).await
    }

    /// Aggregate a single period for every scope.
    pub async fn run_pass(&self, period: AggregationPeriod) -> Result<PassReport, AggregationError> {
        self.inner.run_pass(period).await
    }

    pub fn status(&self) -> WorkerStatus {
        let state = self.inner.lock_state();
        WorkerStatus {
            running: state.running,
            last_run: state.last_run,
            passes_completed: state.passes_completed,
            passes_failed: state.passes_failed,
            backlog: state.backlog.len(),
        }
    }
}

impl<S> WorkerInner<S> {
    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> WorkerInner<S>
where
    S: TelemetrySink,
{
    /// Wall time shifted back by the settle delay; boundaries are due once this passes them.
    fn effective_now(&self) -> DateTime<Utc> {
        let now = self.clock.now_utc();
        TimeDelta::from_std(self.config.settle_delay())
            .ok()
            .and_then(|settle| now.checked_sub_signed(settle))
            .unwrap_or(now)
    }

    fn until_next_tick(&self) -> Duration {
        let effective = self.effective_now();
        let next = AggregationWindow::Hour.next_boundary(effective);
        (next - effective).to_std().unwrap_or(Duration::ZERO)
    }

    async fn run_due(&self, shutdown: Option<&watch::Receiver<bool>>) -> usize {
        let effective = self.effective_now();
        let (mut periods, after) = {
            let mut state = self.lock_state();
            let after = match state.last_run {
                Some(last_run) => Some(last_run),
                None => self
                    .config
                    .catch_up_horizon()
                    .and_then(|horizon| TimeDelta::from_std(horizon).ok())
                    .map(|horizon| effective.checked_sub_signed(horizon).unwrap_or(DateTime::<Utc>::MIN_UTC)),
            };
            (std::mem::take(&mut state.backlog), after)
        };
        for period in boundaries_due(effective, after) {
            if !periods.contains(&period) {
                periods.push(period);
            }
        }
        periods.sort_by(|a, b| a.end.cmp(&b.end).then(a.window.cmp(&b.window)));

        let mut attempted = 0;
        let mut failed = Vec::new();
        for (index, period) in periods.iter().enumerate() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                failed.extend_from_slice(&periods[index..]);
                break;
            }
            attempted += 1;
            match self.run_pass(*period).await {
                Ok(report) if report.is_complete() => {}
                _ => failed.push(*period),
            }
        }

        let mut state = self.lock_state();
        state.last_run = Some(state.last_run.map_or(effective, |last| last.max(effective)));
        for period in failed {
            if !state.backlog.contains(&period) {
                state.backlog.push(period);
            }
        }
        if state.backlog.len() > MAX_BACKLOG {
            let dropped = state.backlog.len() - MAX_BACKLOG;
            state.backlog.drain(..dropped);
            warn!(target: "pulse_scheduler::aggregation", dropped, "aggregation backlog full, oldest periods dropped");
        }
        attempted
    }

    async fn run_pass(&self, period: AggregationPeriod) -> Result<PassReport, AggregationError> {
        let _pass = self.pass_lock.lock().await;
        let window = period.window;
        let limit = self.config.timeout_for(window);
        let started = tokio::time::Instant::now();
        info!(target: "pulse_scheduler::aggregation", %window, period_start = %period.start, "aggregation pass started");

        let result = match tokio::time::timeout(limit, self.aggregate(period)).await {
            Ok(result) => result,
            Err(_) => Err(AggregationError::Timeout { window, elapsed: started.elapsed(), limit }),
        };

        let event = match &result {
            Ok(report) => {
                info!(
                    target: "pulse_scheduler::aggregation",
                    %window,
                    period_start = %period.start,
                    scopes = report.scopes,
                    failed_scopes = report.failed_scopes.len(),
                    duration_ms = report.duration.as_millis() as u64,
                    "aggregation pass finished"
                );
                self.lock_state().passes_completed += 1;
                AggregationEvent::PassCompleted {
                    window,
                    period_start: period.start,
                    scopes: report.scopes,
                    failed_scopes: report.failed_scopes.len(),
                    duration: report.duration,
                }
            }
            Err(err) => {
                error!(target: "pulse_scheduler::aggregation", %window, period_start = %period.start, error = %err, "aggregation pass failed");
                self.lock_state().passes_failed += 1;
                match err {
                    AggregationError::Timeout { limit, .. } => {
                        AggregationEvent::PassTimedOut { window, period_start: period.start, limit: *limit }
                    }
                    other => AggregationEvent::PassFailed {
                        window,
                        period_start: period.start,
                        error: other.to_string(),
                    },
                }
            }
        };
        emit_best_effort(&self.sink, ControlEvent::Aggregation(event)).await;
        result
    }

    async fn aggregate(&self, period: AggregationPeriod) -> Result<PassReport, AggregationError> {
        let started = tokio::time::Instant::now();
        let scopes = self.store.list_scopes().await?;
        let mut report = PassReport { period, scopes: 0, failed_scopes: Vec::new(), duration: Duration::ZERO };

        for scope in scopes {
            match self.aggregate_scope(&scope, period).await {
                Ok(()) => report.scopes += 1,
                Err(err) => {
                    warn!(target: "pulse_scheduler::aggregation", scope = %scope, window = %period.window, error = %err, "scope aggregation failed");
                    report.failed_scopes.push(scope);
                }
            }
        }
        report.duration = started.elapsed();
        Ok(report)
    }

    async fn aggregate_scope(&self, scope: &str, period: AggregationPeriod) -> Result<(), StoreError> {
        let events = self.store.query_raw_events(scope, period.start..period.end).await?;
        let record = AggregateRecord {
            key: AggregateKey { scope: scope.to_owned(), window: period.window, period_start: period.start },
            period_end: period.end,
            summary: UsageSummary::from_events(&events),
            computed_at: self.clock.now_utc(),
        };
        self.store.upsert_aggregate(record).await
    }
}

async fn run_loop<S>(inner: Weak<WorkerInner<S>>, mut shutdown: watch::Receiver<bool>)
where
    S: TelemetrySink,
{
    // Catch-up pass.
    match inner.upgrade() {
        Some(worker) => {
            worker.run_due(Some(&shutdown)).await;
        }
        None => return,
    }

    loop {
        let Some(sleep_for) = inner.upgrade().map(|worker| worker.until_next_tick()) else {
            break;
        };
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(sleep_for) => {
                let Some(worker) = inner.upgrade() else { break };
                worker.run_due(Some(&shutdown)).await;
            }
        }
    }
}

/// Builder for [`AggregationWorker`].
pub struct AggregationWorkerBuilder<S = NullSink> {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn WallClock>,
    config: AggregationConfig,
    sink: S,
}

impl<S> AggregationWorkerBuilder<S>
where
    S: TelemetrySink,
{
    pub fn clock<W>(mut self, clock: W) -> Self
    where
        W: WallClock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(mut self, config: AggregationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sink<S2>(self, sink: S2) -> AggregationWorkerBuilder<S2>
    where
        S2: TelemetrySink,
    {
        AggregationWorkerBuilder { store: self.store, clock: self.clock, config: self.config, sink }
    }

    pub fn build(self) -> Result<AggregationWorker<S>, ConfigError> {
        self.config.validate()?;
        Ok(AggregationWorker {
            inner: Arc::new(WorkerInner {
                store: self.store,
                clock: self.clock,
                config: self.config,
                sink: self.sink,
                pass_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(WorkerState::default()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{InMemoryUsageStore, UsageEvent, UsageEventKind};
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn worker(store: &InMemoryUsageStore, clock: &ManualClock, horizon_secs: u64) -> AggregationWorker {
        AggregationWorker::builder(store.clone())
            .clock(clock.clone())
            .config(AggregationConfig { catch_up_horizon_secs: horizon_secs, ..Default::default() })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn hour_pass_is_idempotent() {
        let store = InMemoryUsageStore::new();
        store.add_scope("p1");
        store.record_event(UsageEvent::new("p1", UsageEventKind::ApiRequest, 1.0, at(2024, 5, 14, 8, 10)));
        store.record_event(UsageEvent::new("p1", UsageEventKind::ApiRequest, 1.0, at(2024, 5, 14, 8, 20)));
        let clock = ManualClock::new(at(2024, 5, 14, 9, 5));
        let worker = worker(&store, &clock, 0);

        let period = AggregationWindow::Hour.last_completed(clock.now_utc());
        let first = worker.run_pass(period).await.unwrap();
        let second = worker.run_pass(period).await.unwrap();
        assert!(first.is_complete() && second.is_complete());

        let key = AggregateKey { scope: "p1".into(), window: AggregationWindow::Hour, period_start: period.start };
        let stored = store.get_aggregate(&key).await.unwrap().unwrap();
        assert_eq!(stored.summary.api_requests, 2);
        assert_eq!(store.aggregate_count(), 1);
        assert_eq!(worker.status().passes_completed, 2);
    }

    #[tokio::test]
    async fn run_due_advances_last_run() {
        let store = InMemoryUsageStore::new();
        store.add_scope("p1");
        let clock = ManualClock::new(at(2024, 5, 14, 9, 5));
        let worker = worker(&store, &clock, 0);

        assert_eq!(worker.run_due().await, 1);
        assert_eq!(worker.run_due().await, 0);

        clock.advance(Duration::from_secs(2 * 3600));
        assert_eq!(worker.run_due().await, 2);
        assert_eq!(worker.status().last_run, Some(at(2024, 5, 14, 11, 5)));
    }

    #[derive(Clone)]
    struct Unavailable;

    #[async_trait::async_trait]
    impl UsageStore for Unavailable {
        async fn list_scopes(&self) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn query_raw_events(
            &self,
            _scope: &str,
            _range: std::ops::Range<DateTime<Utc>>,
        ) -> Result<Vec<UsageEvent>, StoreError> {
            Ok(Vec::new())
        }
        async fn upsert_aggregate(&self, _record: AggregateRecord) -> Result<(), StoreError> {
            Ok(())
        }
        async fn get_aggregate(&self, _key: &AggregateKey) -> Result<Option<AggregateRecord>, StoreError> {
            Ok(None)
        }
        async fn aggregates_in_range(
            &self,
            _scope: &str,
            _window: AggregationWindow,
            _range: std::ops::Range<DateTime<Utc>>,
        ) -> Result<Vec<AggregateRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_period_is_kept_for_next_tick() {
        let clock = ManualClock::new(at(2024, 5, 14, 9, 5));
        let worker = AggregationWorker::builder(Unavailable)
            .clock(clock.clone())
            .config(AggregationConfig { catch_up_horizon_secs: 0, ..Default::default() })
            .build()
            .unwrap();

        assert_eq!(worker.run_due().await, 1);
        assert_eq!(worker.status().backlog, 1);
        assert_eq!(worker.status().passes_failed, 1);

        // same hour: only the backlog is retried, and it stays deduplicated
        assert_eq!(worker.run_due().await, 1);
        assert_eq!(worker.status().backlog, 1);
    }
}
