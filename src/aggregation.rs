//! Boundary-aligned usage aggregation.
//!
//! Raw usage events are rolled into hourly, daily and monthly summaries per scope. Scheduling is
//! derived from the wall clock by [`boundaries_due`], a pure function of `(now, last_run)`: every
//! hour boundary runs the hourly pass, midnight adds the daily pass, and midnight on the 1st adds
//! the monthly pass. Writes are upserts keyed by `(scope, window, period_start)`, so any period
//! can be re-run safely; the worker relies on this for catch-up after a restart and for retrying
//! failed periods on the next tick.
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use pulse_scheduler::aggregation::{boundaries_due, AggregationWindow};
//!
//! let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
//! let windows: Vec<_> = boundaries_due(now, None).into_iter().map(|p| p.window).collect();
//! assert_eq!(windows, [AggregationWindow::Hour, AggregationWindow::Day, AggregationWindow::Month]);
//! ```

pub mod schedule;
pub mod store;
pub mod window;
pub mod worker;

pub use schedule::{boundaries_due, periods_closed_at, MAX_CATCH_UP_HOURS};
pub use store::{
    AggregateKey, AggregateRecord, InMemoryUsageStore, UsageEvent, UsageEventKind, UsageStore,
    UsageSummary,
};
pub use window::{AggregationPeriod, AggregationWindow};
pub use worker::{AggregationWorker, AggregationWorkerBuilder, PassReport, WorkerStatus, MAX_BACKLOG};
