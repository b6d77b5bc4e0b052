use crate::admission::{Decision, SweeperHandle};
use crate::clock::{Clock, MonotonicClock};
use crate::config::AdmissionConfig;
use crate::error::ConfigError;
use crate::telemetry::{NullSink, TelemetrySink};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Sliding-window log limiter.
///
/// Admits at most `limit` requests per key within any trailing `window`. Timestamps come from
/// the injected [`Clock`] (monotonic milliseconds).
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    window_millis: u64,
    clock: Arc<dyn Clock>,
    logs: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter admitting `limit` requests per `window` for every key.
    pub fn new(limit: u32, window: Duration) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        if window.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "window" });
        }
        Ok(Self {
            limit,
            window,
            window_millis: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            clock: Arc::new(MonotonicClock::default()),
            logs: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &AdmissionConfig) -> Result<Self, ConfigError> {
        Self::new(config.limit, config.window())
    }

    /// Replace the time source (tests inject a manual or tokio-driven clock).
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an admission for `key` if its window has room.
    pub fn allow(&self, key: impl AsRef<str>) -> bool {
        self.check(key).is_allowed()
    }

    /// Like [`allow`](Self::allow), but reports remaining capacity or the wait until the next slot.
    pub fn check(&self, key: impl AsRef<str>) -> Decision {
        let key = key.as_ref();
        let now = self.clock.now_millis();
        let mut logs = self.logs();

        let log = match logs.get_mut(key) {
            Some(log) => log,
            None => logs.entry(key.to_owned()).or_default(),
        };
        prune(log, now, self.window_millis);

        let admitted = u32::try_from(log.len()).unwrap_or(u32::MAX);
        if admitted >= self.limit {
            let oldest = log.front().copied().unwrap_or(now);
            let age = now.saturating_sub(oldest);
            let retry_after = Duration::from_millis(self.window_millis.saturating_sub(age));
            debug!(target: "pulse_scheduler::admission", key, retry_after_ms = retry_after.as_millis() as u64, "admission rejected");
            return Decision::Denied { retry_after };
        }

        log.push_back(now);
        Decision::Allowed { remaining: self.limit - admitted - 1 }
    }

    /// Number of admissions currently counted against `key`, without recording one.
    pub fn in_window(&self, key: impl AsRef<str>) -> usize {
        let now = self.clock.now_millis();
        self.logs()
            .get(key.as_ref())
            .map(|log| log.iter().filter(|&&t| now.saturating_sub(t) < self.window_millis).count())
            .unwrap_or(0)
    }

    /// Number of keys with retained state.
    pub fn tracked_keys(&self) -> usize {
        self.logs().len()
    }

    /// Prune every key's log and forget keys whose log emptied. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut logs = self.logs();
        let before = logs.len();
        logs.retain(|_, log| {
            prune(log, now, self.window_millis);
            !log.is_empty()
        });
        before - logs.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` on the current tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        self.spawn_sweeper_with_sink(interval, NullSink)
    }

    /// Like [`spawn_sweeper`](Self::spawn_sweeper), reporting each sweep to `sink`.
    pub fn spawn_sweeper_with_sink<S>(self: &Arc<Self>, interval: Duration, sink: S) -> SweeperHandle
    where
        S: TelemetrySink,
    {
        SweeperHandle::spawn(Arc::clone(self), interval, sink)
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<String, VecDeque<u64>>> {
        // A panic mid-update leaves at worst an unpruned log, which the next access prunes.
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop timestamps that are `window` or older. Logs are append-only, so the oldest sit in front.
fn prune(log: &mut VecDeque<u64>, now: u64, window_millis: u64) {
    while log.front().is_some_and(|&t| now.saturating_sub(t) >= window_millis) {
        log.pop_front();
    }
}
