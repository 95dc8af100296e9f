use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Half-open date interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, HarvestError> {
        if end <= start {
            return Err(HarvestError::InvalidRange(format!(
                "window end {end} is not after start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// What to do with a trailing range shorter than the interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemainderPolicy {
    /// Emit the remainder as its own, shorter, final window.
    #[default]
    Split,
    /// Fold the remainder into the preceding window.
    Merge,
}

pub fn window(
    start: NaiveDate,
    end: NaiveDate,
    interval_days: i64,
) -> Result<Vec<TimeWindow>, HarvestError> {
    window_with(start, end, interval_days, RemainderPolicy::Split)
}

/// Partitions `[start, end)` into consecutive windows of `interval_days`.
pub fn window_with(
    start: NaiveDate,
    end: NaiveDate,
    interval_days: i64,
    policy: RemainderPolicy,
) -> Result<Vec<TimeWindow>, HarvestError> {
    if end <= start {
        return Err(HarvestError::InvalidRange(format!(
            "end date {end} is not after start date {start}"
        )));
    }
    if interval_days <= 0 {
        return Err(HarvestError::InvalidRange(format!(
            "interval must be a positive number of days, got {interval_days}"
        )));
    }

    let interval = Duration::days(interval_days);
    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + interval).min(end);
        windows.push(TimeWindow {
            start: cursor,
            end: next,
        });
        cursor = next;
    }

    if policy == RemainderPolicy::Merge && windows.len() > 1 {
        let last = windows[windows.len() - 1];
        if last.days() < interval_days {
            windows.pop();
            if let Some(previous) = windows.last_mut() {
                previous.end = last.end;
            }
        }
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn assert_partition(windows: &[TimeWindow], start: NaiveDate, end: NaiveDate) {
        assert_eq!(windows.first().unwrap().start, start);
        assert_eq!(windows.last().unwrap().end, end);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[0].end);
        }
    }

    #[test]
    fn rejects_empty_and_inverted_ranges() {
        let day = date(2020, 1, 1);
        assert_matches!(window(day, day, 5), Err(HarvestError::InvalidRange(_)));
        assert_matches!(window(day, date(2019, 1, 1), 5), Err(HarvestError::InvalidRange(_)));
        assert_matches!(window(day, date(2020, 2, 1), 0), Err(HarvestError::InvalidRange(_)));
        assert_matches!(window(day, date(2020, 2, 1), -3), Err(HarvestError::InvalidRange(_)));
    }

    #[test]
    fn split_count_is_ceiling() {
        for (span, interval) in [(31, 15), (30, 15), (1, 30), (365, 7), (10, 10), (11, 10)] {
            let start = date(2018, 1, 1);
            let end = start + Duration::days(span);
            let windows = window(start, end, interval).unwrap();
            assert_eq!(windows.len() as i64, (span + interval - 1) / interval);
            assert_partition(&windows, start, end);
        }
    }

    #[test]
    fn split_keeps_short_final_window() {
        let windows = window(date(2018, 1, 1), date(2018, 2, 1), 15).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].start, date(2018, 1, 31));
        assert_eq!(windows[2].days(), 1);
    }

    #[test]
    fn merge_folds_remainder_into_previous_window() {
        let windows =
            window_with(date(2018, 1, 1), date(2018, 2, 1), 15, RemainderPolicy::Merge).unwrap();
        assert_eq!(
            windows,
            vec![
                TimeWindow::new(date(2018, 1, 1), date(2018, 1, 16)).unwrap(),
                TimeWindow::new(date(2018, 1, 16), date(2018, 2, 1)).unwrap(),
            ]
        );
    }

    #[test]
    fn merge_keeps_single_short_window() {
        let windows =
            window_with(date(2018, 1, 1), date(2018, 1, 5), 15, RemainderPolicy::Merge).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].days(), 4);
    }
}
