use crate::clock::{SystemClock, WallClock};
use crate::config::RetryConfig;
use crate::error::{ConfigError, SchedulerError, StoreError};
use crate::retry::{
    DeliveryExecutor, FailedDelivery, FailurePolicy, ItemId, NoReschedule, RetryItem,
    RetryPersistence,
};
use crate::telemetry::{emit_best_effort, ControlEvent, NullSink, RetryEvent, TelemetrySink};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshot of scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Items with a live timer.
    pub pending: usize,
    /// Deliveries currently running.
    pub in_flight: usize,
    pub running: bool,
}

/// Per-item timer scheduler.
///
/// Cheap to clone; clones share the same timers. Must be used from within a tokio runtime.
pub struct RetryScheduler<C, S = NullSink> {
    inner: Arc<Inner<C, S>>,
}

impl<C, S> Clone for RetryScheduler<C, S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C, S> std::fmt::Debug for RetryScheduler<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("RetryScheduler")
            .field("running", &state.running)
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight.len())
            .finish_non_exhaustive()
    }
}

struct Inner<C, S> {
    executor: Arc<dyn DeliveryExecutor<C>>,
    persistence: Option<Arc<dyn RetryPersistence<C>>>,
    failure_policy: Arc<dyn FailurePolicy<C>>,
    clock: Arc<dyn WallClock>,
    sink: S,
    reconcile_interval: Duration,
    state: Mutex<State>,
    in_flight: watch::Sender<usize>,
}

#[derive(Default)]
struct State {
    running: bool,
    next_generation: u64,
    pending: HashMap<ItemId, PendingTimer>,
    in_flight: HashSet<ItemId>,
    reconciler: Option<Reconciler>,
}

struct PendingTimer {
    generation: u64,
    not_before: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct Reconciler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Replace,
    IfAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registered {
    New,
    Replaced,
    Skipped,
}

impl<C> RetryScheduler<C, NullSink>
where
    C: Send + Sync + 'static,
{
    /// Start building a scheduler around `executor`.
    pub fn builder<E>(executor: E) -> RetrySchedulerBuilder<C, NullSink>
    where
        E: DeliveryExecutor<C>,
    {
        RetrySchedulerBuilder {
            executor: Arc::new(executor),
            persistence: None,
            failure_policy: Arc::new(NoReschedule),
            clock: Arc::new(SystemClock),
            sink: NullSink,
            reconcile_interval: RetryConfig::default().reconcile_interval(),
        }
    }
}

impl<C, S> RetryScheduler<C, S>
where
    C: Send + Sync + 'static,
    S: TelemetrySink,
{
    /// Begin accepting items. Starts reconciliation when persistence is configured.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.inner.lock_state();
        if state.running {
            return Err(SchedulerError::AlreadyRunning);
        }
        state.running = true;

        if self.inner.persistence.is_some() {
            let (shutdown, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(reconcile_loop(
                Arc::downgrade(&self.inner),
                self.inner.reconcile_interval,
                shutdown_rx,
            ));
            state.reconciler = Some(Reconciler { shutdown, task });
        }
        info!(target: "pulse_scheduler::retry", "retry scheduler started");
        Ok(())
    }

    /// Cancel every pending timer, stop reconciliation and wait for running deliveries.
    ///
    /// Pending items are not delivered. Calling `stop` on a stopped scheduler is a no-op.
    pub async fn stop(&self) {
        let (timers, reconciler) = {
            let mut state = self.inner.lock_state();
            if !state.running {
                return;
            }
            state.running = false;
            let timers: Vec<_> = state.pending.drain().map(|(_, timer)| timer.handle).collect();
            (timers, state.reconciler.take())
        };

        for handle in &timers {
            handle.abort();
        }
        if let Some(reconciler) = reconciler {
            let _ = reconciler.shutdown.send(true);
            let _ = reconciler.task.await;
        }
        let cancelled = timers.len();
        for handle in timers {
            let _ = handle.await;
        }

        let mut in_flight = self.inner.in_flight.subscribe();
        let _ = in_flight.wait_for(|n| *n == 0).await;
        info!(target: "pulse_scheduler::retry", cancelled, "retry scheduler stopped");
    }

    /// Register (or replace) the timer for `item.id`.
    pub fn schedule_retry(&self, item: RetryItem<C>) -> Result<(), SchedulerError> {
        self.inner.register(item, Registration::Replace).map(|_| ())
    }

    /// Remove the pending timer for `id`. Returns whether one existed.
    ///
    /// A delivery that has already started is not interrupted.
    pub fn cancel_retry(&self, id: &ItemId) -> bool {
        let removed = self.inner.lock_state().pending.remove(id);
        match removed {
            Some(timer) => {
                timer.handle.abort();
                info!(target: "pulse_scheduler::retry", item_id = %id, "retry cancelled");
                self.inner.emit_detached(RetryEvent::Cancelled { item_id: id.to_string() });
                true
            }
            None => false,
        }
    }

    /// Register timers for persisted items that have none. Returns the number registered.
    ///
    /// Items with a pending timer or a running delivery are left alone. Without persistence this
    /// returns `Ok(0)`.
    pub async fn reconcile(&self) -> Result<usize, StoreError> {
        self.inner.reconcile().await
    }

    pub fn stats(&self) -> RetryStats {
        let state = self.inner.lock_state();
        RetryStats { pending: state.pending.len(), in_flight: state.in_flight.len(), running: state.running }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    pub fn is_pending(&self, id: &ItemId) -> bool {
        self.inner.lock_state().pending.contains_key(id)
    }

    /// Deadline of the pending timer for `id`.
    pub fn next_fire_at(&self, id: &ItemId) -> Option<DateTime<Utc>> {
        self.inner.lock_state().pending.get(id).map(|timer| timer.not_before)
    }
}

impl<C, S> Inner<C, S> {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn end_delivery(&self, id: &ItemId) {
        self.lock_state().in_flight.remove(id);
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl<C, S> Inner<C, S>
where
    C: Send + Sync + 'static,
    S: TelemetrySink,
{
    fn register(self: &Arc<Self>, item: RetryItem<C>, mode: Registration) -> Result<Registered, SchedulerError> {
        let now = self.clock.now_utc();
        let delay = (item.not_before - now).to_std().unwrap_or(Duration::ZERO);
        let RetryItem { id, not_before, context } = item;

        let replaced = {
            let mut state = self.lock_state();
            if !state.running {
                return Err(SchedulerError::NotRunning);
            }
            if mode == Registration::IfAbsent
                && (state.pending.contains_key(&id) || state.in_flight.contains(&id))
            {
                return Ok(Registered::Skipped);
            }

            state.next_generation += 1;
            let generation = state.next_generation;
            let weak = Arc::downgrade(self);
            let timer_id = id.clone();
            // Spawned under the lock, so the timer is in `pending` before it can fire.
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.fire(timer_id, generation, context).await;
                }
            });

            let previous = state.pending.insert(id.clone(), PendingTimer { generation, not_before, handle });
            previous.map(|timer| timer.handle.abort()).is_some()
        };

        if replaced {
            info!(target: "pulse_scheduler::retry", item_id = %id, %not_before, "retry rescheduled, previous timer discarded");
        } else {
            info!(target: "pulse_scheduler::retry", item_id = %id, %not_before, "retry scheduled");
        }
        self.emit_detached(RetryEvent::Scheduled { item_id: id.to_string(), not_before, replaced });
        Ok(if replaced { Registered::Replaced } else { Registered::New })
    }

    /// Claim the item for delivery. Fails if the timer was cancelled, replaced or stopped.
    fn begin_delivery(&self, id: &ItemId, generation: u64) -> bool {
        let mut state = self.lock_state();
        if !state.running {
            return false;
        }
        match state.pending.get(id) {
            Some(timer) if timer.generation == generation => {}
            _ => return false,
        }
        state.pending.remove(id);
        state.in_flight.insert(id.clone());
        self.in_flight.send_modify(|n| *n += 1);
        true
    }

    async fn fire(self: Arc<Self>, id: ItemId, generation: u64, context: C) {
        if !self.begin_delivery(&id, generation) {
            return;
        }
        let _guard = InFlightGuard { inner: &self, id: &id };

        info!(target: "pulse_scheduler::retry", item_id = %id, "retry fired");
        emit_best_effort(&self.sink, ControlEvent::Retry(RetryEvent::Fired { item_id: id.to_string() })).await;

        match self.executor.deliver(&id, &context).await {
            Ok(()) => {
                debug!(target: "pulse_scheduler::retry", item_id = %id, "delivery succeeded");
                emit_best_effort(&self.sink, ControlEvent::Retry(RetryEvent::Delivered { item_id: id.to_string() }))
                    .await;
            }
            Err(error) => {
                warn!(target: "pulse_scheduler::retry", item_id = %id, %error, "delivery failed");
                emit_best_effort(
                    &self.sink,
                    ControlEvent::Retry(RetryEvent::DeliveryFailed {
                        item_id: id.to_string(),
                        error: error.to_string(),
                    }),
                )
                .await;

                let failed = FailedDelivery {
                    id: &id,
                    context: &context,
                    error: &error,
                    failed_at: self.clock.now_utc(),
                };
                if let Some(next) = self.failure_policy.on_failure(&failed) {
                    let next_id = next.id.to_string();
                    let not_before = next.not_before;
                    match self.register(next, Registration::Replace) {
                        Ok(_) => {
                            emit_best_effort(
                                &self.sink,
                                ControlEvent::Retry(RetryEvent::Rescheduled { item_id: next_id, not_before }),
                            )
                            .await;
                        }
                        Err(err) => {
                            debug!(target: "pulse_scheduler::retry", item_id = %id, %err, "follow-up retry dropped");
                        }
                    }
                }
            }
        }
    }

    async fn reconcile(self: &Arc<Self>) -> Result<usize, StoreError> {
        let Some(persistence) = self.persistence.as_ref() else {
            return Ok(0);
        };

        let items = match persistence.list_pending_retries().await {
            Ok(items) => items,
            Err(error) => {
                warn!(target: "pulse_scheduler::retry", %error, "retry reconciliation failed");
                emit_best_effort(
                    &self.sink,
                    ControlEvent::Retry(RetryEvent::ReconcileFailed { error: error.to_string() }),
                )
                .await;
                return Err(error);
            }
        };

        let mut registered = 0;
        for item in items {
            match self.register(item, Registration::IfAbsent) {
                Ok(Registered::New) | Ok(Registered::Replaced) => registered += 1,
                Ok(Registered::Skipped) => {}
                Err(SchedulerError::NotRunning) | Err(SchedulerError::AlreadyRunning) => break,
            }
        }

        debug!(target: "pulse_scheduler::retry", registered, "retry reconciliation finished");
        emit_best_effort(&self.sink, ControlEvent::Retry(RetryEvent::Reconciled { registered })).await;
        Ok(registered)
    }

    /// Emit from a synchronous call site.
    ///
    /// The event is sent from a spawned task, so it is not ordered with events emitted inline by
    /// `fire` and may reach the sink after `stop` returned.
    fn emit_detached(&self, event: RetryEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            emit_best_effort(&sink, ControlEvent::Retry(event)).await;
        });
    }
}

impl<C, S> Drop for Inner<C, S> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, timer) in state.pending.drain() {
            timer.handle.abort();
        }
        if let Some(reconciler) = state.reconciler.take() {
            reconciler.task.abort();
        }
    }
}

struct InFlightGuard<'a, C, S> {
    inner: &'a Inner<C, S>,
    id: &'a ItemId,
}

impl<C, S> Drop for InFlightGuard<'_, C, S> {
    fn drop(&mut self) {
        self.inner.end_delivery(self.id);
    }
}

async fn reconcile_loop<C, S>(inner: Weak<Inner<C, S>>, interval: Duration, mut shutdown: watch::Receiver<bool>)
where
    C: Send + Sync + 'static,
    S: TelemetrySink,
{
    // First tick completes immediately: reconcile once at start.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let _ = inner.reconcile().await;
            }
        }
    }
}

/// Builder for [`RetryScheduler`].
pub struct RetrySchedulerBuilder<C, S = NullSink> {
    executor: Arc<dyn DeliveryExecutor<C>>,
    persistence: Option<Arc<dyn RetryPersistence<C>>>,
    failure_policy: Arc<dyn FailurePolicy<C>>,
    clock: Arc<dyn WallClock>,
    sink: S,
    reconcile_interval: Duration,
}

impl<C, S> RetrySchedulerBuilder<C, S>
where
    C: Send + Sync + 'static,
    S: TelemetrySink,
{
    pub fn persistence<P>(mut self, persistence: P) -> Self
    where
        P: RetryPersistence<C>,
    {
        self.persistence = Some(Arc::new(persistence));
        self
    }

    pub fn failure_policy<P>(mut self, policy: P) -> Self
    where
        P: FailurePolicy<C>,
    {
        self.failure_policy = Arc::new(policy);
        self
    }

    pub fn clock<W>(mut self, clock: W) -> Self
    where
        W: WallClock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn config(self, config: &RetryConfig) -> Self {
        self.reconcile_interval(config.reconcile_interval())
    }

    /// Replace the telemetry sink.
    pub fn sink<S2>(self, sink: S2) -> RetrySchedulerBuilder<C, S2>
    where
        S2: TelemetrySink,
    {
        RetrySchedulerBuilder {
            executor: self.executor,
            persistence: self.persistence,
            failure_policy: self.failure_policy,
            clock: self.clock,
            sink,
            reconcile_interval: self.reconcile_interval,
        }
    }

    pub fn build(self) -> Result<RetryScheduler<C, S>, ConfigError> {
        if self.reconcile_interval.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "reconcile_interval" });
        }
        let (in_flight, _) = watch::channel(0);
        Ok(RetryScheduler {
            inner: Arc::new(Inner {
                executor: self.executor,
                persistence: self.persistence,
                failure_policy: self.failure_policy,
                clock: self.clock,
                sink: self.sink,
                reconcile_interval: self.reconcile_interval,
                state: Mutex::new(State::default()),
                in_flight,
            }),
        })
    }
}
