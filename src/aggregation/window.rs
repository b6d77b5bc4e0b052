use chrono::{DateTime, Datelike, Days, Months, NaiveTime, TimeDelta, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Calendar window an aggregate covers. All boundaries are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggregationWindow {
    #[serde(rename = "hourly")]
    Hour,
    #[serde(rename = "daily")]
    Day,
    #[serde(rename = "monthly")]
    Month,
}

impl AggregationWindow {
    pub const ALL: [AggregationWindow; 3] = [Self::Hour, Self::Day, Self::Month];

    /// Period-type label stored with each aggregate.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hourly",
            Self::Day => "daily",
            Self::Month => "monthly",
        }
    }

    /// Start of the window containing `t`.
    pub fn floor(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let day_start = Utc.from_utc_datetime(&t.date_naive().and_time(NaiveTime::MIN));
        match self {
            Self::Hour => day_start + TimeDelta::hours(i64::from(t.hour())),
            Self::Day => day_start,
            Self::Month => day_start - Days::new(u64::from(t.day0())),
        }
    }

    /// First boundary strictly after `t`.
    pub fn next_boundary(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.advance(self.floor(t))
    }

    /// Latest boundary at or before `t`.
    pub fn previous_boundary(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(t)
    }

    /// The most recent window that has fully elapsed at `now`.
    pub fn last_completed(&self, now: DateTime<Utc>) -> AggregationPeriod {
        let end = self.floor(now);
        AggregationPeriod { window: *self, start: self.retreat(end), end }
    }

    /// The window starting at `start` (which must be a boundary).
    pub fn period_starting(&self, start: DateTime<Utc>) -> AggregationPeriod {
        AggregationPeriod { window: *self, start, end: self.advance(start) }
    }

    /// Whether `t` sits exactly on a boundary of this window.
    pub fn is_boundary(&self, t: DateTime<Utc>) -> bool {
        self.floor(t) == t
    }

    fn advance(&self, boundary: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hour => boundary + TimeDelta::hours(1),
            Self::Day => boundary + Days::new(1),
            Self::Month => boundary + Months::new(1),
        }
    }

    fn retreat(&self, boundary: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hour => boundary - TimeDelta::hours(1),
            Self::Day => boundary - Days::new(1),
            Self::Month => boundary - Months::new(1),
        }
    }
}

impl fmt::Display for AggregationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A half-open interval `[start, end)` aligned to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationPeriod {
    pub window: AggregationWindow,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AggregationPeriod {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for AggregationPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, {})", self.window, self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn floors() {
        let t = at(2024, 2, 29, 17, 45);
        assert_eq!(AggregationWindow::Hour.floor(t), at(2024, 2, 29, 17, 0));
        assert_eq!(AggregationWindow::Day.floor(t), at(2024, 2, 29, 0, 0));
        assert_eq!(AggregationWindow::Month.floor(t), at(2024, 2, 1, 0, 0));
    }

    #[test]
    fn next_boundary_is_strictly_after() {
        let boundary = at(2024, 3, 1, 0, 0);
        assert_eq!(AggregationWindow::Hour.next_boundary(boundary), at(2024, 3, 1, 1, 0));
        assert_eq!(AggregationWindow::Day.next_boundary(at(2024, 12, 31, 23, 59)), at(2025, 1, 1, 0, 0));
        assert_eq!(AggregationWindow::Month.next_boundary(at(2024, 1, 31, 12, 0)), at(2024, 2, 1, 0, 0));
    }

    #[test]
    fn last_completed_month_handles_year_wrap() {
        let period = AggregationWindow::Month.last_completed(at(2025, 1, 1, 0, 5));
        assert_eq!(period.start, at(2024, 12, 1, 0, 0));
        assert_eq!(period.end, at(2025, 1, 1, 0, 0));
        assert!(period.contains(at(2024, 12, 31, 23, 59)));
        assert!(!period.contains(period.end));
    }

    #[test]
    fn last_completed_hour() {
        let period = AggregationWindow::Hour.last_completed(at(2024, 6, 1, 0, 0));
        assert_eq!(period.start, at(2024, 5, 31, 23, 0));
        assert_eq!(period.end, at(2024, 6, 1, 0, 0));
    }

    #[test]
    fn labels() {
        assert_eq!(AggregationWindow::Day.to_string(), "daily");
        assert_eq!(serde_json::to_string(&AggregationWindow::Month).unwrap(), "\"monthly\"");
    }
}
