use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_MINUTE: i64 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: i64 = 60 * NANOS_PER_MINUTE;
const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;
const NANOS_PER_WEEK: i64 = 7 * NANOS_PER_DAY;

/// Inclusive nanosecond window a query's time predicates select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.start != i64::MIN && self.end != i64::MAX
    }

    /// True when contradictory predicates left nothing to select.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub(crate) fn narrow_start(&mut self, start: i64) {
        self.start = self.start.max(start);
    }

    pub(crate) fn narrow_end(&mut self, end: i64) {
        self.end = self.end.min(end);
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::unbounded()
    }
}

fn unit_nanos(unit: &str) -> Option<i64> {
    match unit {
        "ns" => Some(1),
        "u" | "µ" | "us" | "µs" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SECOND),
        "m" => Some(NANOS_PER_MINUTE),
        "h" => Some(NANOS_PER_HOUR),
        "d" => Some(NANOS_PER_DAY),
        "w" => Some(NANOS_PER_WEEK),
        _ => None,
    }
}

/// Parse an InfluxQL duration literal such as `10s` or `1h30m` into nanoseconds.
pub fn parse_duration(input: &str) -> Result<i64, ParseError> {
    let invalid = || ParseError::InvalidDuration(input.to_string());
    let mut total: i64 = 0;
    let mut rest = input;

    if rest.is_empty() {
        return Err(invalid());
    }

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits_end == 0 {
            return Err(invalid());
        }
        let amount: i64 = rest[..digits_end].parse().map_err(|_| invalid())?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let nanos = unit_nanos(&rest[..unit_end]).ok_or_else(invalid)?;
        rest = &rest[unit_end..];

        total = amount
            .checked_mul(nanos)
            .and_then(|n| total.checked_add(n))
            .ok_or_else(invalid)?;
    }

    Ok(total)
}

/// Parse an absolute time string: RFC3339, `YYYY-MM-DD HH:MM:SS[.f]` or a bare
/// date, all taken as UTC.
pub(crate) fn parse_timestamp(input: &str) -> Result<i64, ParseError> {
    let invalid = || ParseError::InvalidTime(input.to_string());

    let utc = if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        dt.naive_utc()
    } else if let Ok(dt) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S%.f") {
        dt
    } else if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?
    } else {
        return Err(invalid());
    };

    utc.and_utc().timestamp_nanos_opt().ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_durations() {
        assert_eq!(parse_duration("10s").unwrap(), 10 * NANOS_PER_SECOND);
        assert_eq!(parse_duration("250ms").unwrap(), 250 * NANOS_PER_MILLI);
        assert_eq!(parse_duration("3u").unwrap(), 3_000);
        assert_eq!(parse_duration("2w").unwrap(), 14 * NANOS_PER_DAY);
    }

    #[test]
    fn compound_duration() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            NANOS_PER_HOUR + 30 * NANOS_PER_MINUTE
        );
    }

    #[test]
    fn bad_durations_error() {
        for input in ["", "h", "10", "10y", "1.5h"] {
            assert!(parse_duration(input).is_err(), "{input} should fail");
        }
    }

    #[test]
    fn rfc3339_timestamp() {
        assert_eq!(
            parse_timestamp("2022-01-01T00:00:00Z").unwrap(),
            1_640_995_200 * NANOS_PER_SECOND
        );
        assert_eq!(
            parse_timestamp("2022-01-01T01:00:00+01:00").unwrap(),
            1_640_995_200 * NANOS_PER_SECOND
        );
    }

    #[test]
    fn space_separated_and_date_only() {
        assert_eq!(
            parse_timestamp("2022-01-01 00:00:01.5").unwrap(),
            1_640_995_201 * NANOS_PER_SECOND + 500 * NANOS_PER_MILLI
        );
        assert_eq!(
            parse_timestamp("2022-01-01").unwrap(),
            1_640_995_200 * NANOS_PER_SECOND
        );
    }

    #[test]
    fn window_overlap() {
        let a = TimeWindow::new(0, 10);
        assert!(a.overlaps(&TimeWindow::new(10, 20)));
        assert!(!a.overlaps(&TimeWindow::new(11, 20)));
        assert!(TimeWindow::new(5, 4).is_empty());
        assert!(!TimeWindow::unbounded().is_bounded());
    }
}
