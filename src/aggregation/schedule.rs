//! Which periods are due, given the last time the worker ran.
//!
//! Every hour boundary `b` with `last_run < b <= now` completes an hourly period. A boundary that
//! is also midnight completes the day, and midnight on the 1st completes the month. Periods are
//! returned ordered by end time, and hourly before daily before monthly for a shared end, so a
//! month is never rolled up before the day and hour that close it.

use crate::aggregation::{AggregationPeriod, AggregationWindow};
use chrono::{DateTime, TimeDelta, Utc};

/// Upper bound on how far back a single call looks (62 days of hours).
pub const MAX_CATCH_UP_HOURS: i64 = 62 * 24;

/// Periods completed by boundaries in `(last_run, now]`.
///
/// With no `last_run` only the latest boundary is considered, which matches a fresh start: the
/// previous hour always runs, the previous day only when starting at midnight, the previous
/// month only when starting at midnight on the 1st.
pub fn boundaries_due(now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> Vec<AggregationPeriod> {
    let latest = AggregationWindow::Hour.floor(now);
    let horizon = latest - TimeDelta::hours(MAX_CATCH_UP_HOURS - 1);
    let after = match last_run {
        Some(last_run) => last_run.max(horizon - TimeDelta::seconds(1)),
        None => latest - TimeDelta::seconds(1),
    };

    let mut due = Vec::new();
    let mut boundary = AggregationWindow::Hour.next_boundary(after);
    while boundary <= now {
        due.extend(periods_closed_at(boundary));
        boundary += TimeDelta::hours(1);
    }
    due
}

/// The periods whose end is exactly `boundary`, finest window first.
pub fn periods_closed_at(boundary: DateTime<Utc>) -> Vec<AggregationPeriod> {
    AggregationWindow::ALL
        .into_iter()
        .filter(|window| window.is_boundary(boundary))
        .map(|window| window.last_completed(boundary))
        .collect()
}
