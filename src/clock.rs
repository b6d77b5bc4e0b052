//! Clock abstractions used by the limiter, the retry scheduler and the aggregation worker.
//!
//! Two notions of time are kept apart:
//! - [`Clock`]: monotonic milliseconds, used for sliding-window bookkeeping.
//! - [`WallClock`]: UTC wall time, used for retry deadlines and calendar boundaries.
//!
//! [`TokioClock`] derives both from tokio's clock so that `#[tokio::test(start_paused = true)]`
//! and `tokio::time::advance` drive every component deterministically.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Wall-clock source for calendar-aligned work.
pub trait WallClock: Send + Sync + std::fmt::Debug {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Notes: resets when the process restarts, which is fine for admission state that is
/// itself reset on restart.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Production wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that follows tokio's (possibly paused) timer.
///
/// Wall time is `anchor + elapsed`, where `elapsed` is measured with `tokio::time::Instant`.
/// Must be created inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    /// Start a clock whose wall time begins at `anchor`.
    pub fn anchored_at(anchor: DateTime<Utc>) -> Self {
        Self { anchor, start: tokio::time::Instant::now() }
    }

    /// Start a clock anchored at the current system time.
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    fn elapsed(&self) -> Duration {
        tokio::time::Instant::now().saturating_duration_since(self.start)
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl WallClock for TokioClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.elapsed()).unwrap_or(TimeDelta::MAX);
        self.anchor.checked_add_signed(elapsed).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug)]
struct ManualState {
    wall: DateTime<Utc>,
    millis: u64,
}

/// Hand-driven clock for pure unit tests. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self { state: Arc::new(Mutex::new(ManualState { wall, millis: 0 })) }
    }

    /// Move both the wall clock and the monotonic counter forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.millis = state.millis.saturating_add(u64::try_from(by.as_millis()).unwrap_or(u64::MAX));
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        state.wall = state.wall.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Jump the wall clock; the monotonic counter is left untouched.
    pub fn set_utc(&self, wall: DateTime<Utc>) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).wall = wall;
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).millis
    }
}

impl WallClock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).wall
    }
}
