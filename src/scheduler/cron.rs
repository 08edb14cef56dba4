//! Cron expression engine.
//!
//! Accepts the classic 5-field form (`minute hour day month weekday`) and the
//! 6-field form with a leading seconds column. Every field supports `*`,
//! single values, ranges (`a-b`), lists (`a,b,c`) and steps (`*/n`, `a-b/n`,
//! `a/n`). Months and weekdays also accept three-letter names, and weekday
//! `7` is an alias for Sunday (`0`).
//!
//! All fields are matched conjunctively: a timestamp fires only when every
//! field accepts it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use thiserror::Error;

/// How far ahead `next_after` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("schedule '{0}' has no upcoming fire time")]
    NoUpcomingFireTime(String),
}

/// The columns of a cron expression, in 6-field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl Field {
    fn name(self) -> &'static str {
        match self {
            Field::Second => "second",
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::DayOfMonth => "day-of-month",
            Field::Month => "month",
            Field::DayOfWeek => "day-of-week",
        }
    }

    /// Inclusive bounds accepted in the expression text.
    fn bounds(self) -> (u32, u32) {
        match self {
            Field::Second | Field::Minute => (0, 59),
            Field::Hour => (0, 23),
            Field::DayOfMonth => (1, 31),
            Field::Month => (1, 12),
            Field::DayOfWeek => (0, 7),
        }
    }

    fn names(self) -> Option<(&'static [&'static str], u32)> {
        match self {
            Field::Month => Some((&MONTH_NAMES, 1)),
            Field::DayOfWeek => Some((&WEEKDAY_NAMES, 0)),
            _ => None,
        }
    }
}

/// Set of accepted values for one field, as a bitmask over 0..=63.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    expr: String,
    with_seconds: bool,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days: FieldSet,
    months: FieldSet,
    weekdays: FieldSet,
}

impl Schedule {
    /// Parse a 5- or 6-field cron expression.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let invalid = |reason: String| CronError::InvalidSchedule {
            expr: expr.to_string(),
            reason,
        };

        let parts: Vec<&str> = expr.split_whitespace().collect();
        let (with_seconds, seconds, rest) = match parts.len() {
            5 => (false, None, &parts[..]),
            6 => (true, Some(parts[0]), &parts[1..]),
            n => return Err(invalid(format!("expected 5 or 6 fields, found {n}"))),
        };

        let seconds = match seconds {
            Some(text) => parse_field(text, Field::Second).map_err(invalid)?,
            None => FieldSet(1),
        };
        let minutes = parse_field(rest[0], Field::Minute).map_err(invalid)?;
        let hours = parse_field(rest[1], Field::Hour).map_err(invalid)?;
        let days = parse_field(rest[2], Field::DayOfMonth).map_err(invalid)?;
        let months = parse_field(rest[3], Field::Month).map_err(invalid)?;
        let mut weekdays = parse_field(rest[4], Field::DayOfWeek).map_err(invalid)?;
        if weekdays.contains(7) {
            weekdays.insert(0);
        }

        Ok(Self {
            expr: parts.join(" "),
            with_seconds,
            seconds,
            minutes,
            hours,
            days,
            months,
            weekdays,
        })
    }

    /// Whether the expression carries a seconds column.
    pub fn has_seconds(&self) -> bool {
        self.with_seconds
    }

    /// The first fire time strictly after `after`.
    ///
    /// Walks forward one unit (second or minute) at a time, skipping whole
    /// months, days, hours or minutes as soon as a coarser field rejects the
    /// candidate. Gives up after roughly four years.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let exhausted = || CronError::NoUpcomingFireTime(self.expr.clone());

        let base = after.naive_utc();
        let start = if self.with_seconds {
            truncate(base, Unit::Second).map(|t| t + Duration::seconds(1))
        } else {
            truncate(base, Unit::Minute).map(|t| t + Duration::minutes(1))
        };
        let mut t = start.ok_or_else(exhausted)?;
        let horizon = base + Duration::days(SEARCH_HORIZON_DAYS);

        while t <= horizon {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t).ok_or_else(exhausted)?;
                continue;
            }
            if !self.days.contains(t.day())
                || !self.weekdays.contains(t.weekday().num_days_from_sunday())
            {
                t = truncate(t, Unit::Day).ok_or_else(exhausted)? + Duration::days(1);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = truncate(t, Unit::Hour).ok_or_else(exhausted)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = truncate(t, Unit::Minute).ok_or_else(exhausted)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Ok(Utc.from_utc_datetime(&t));
        }

        Err(exhausted())
    }

    /// Up to `count` consecutive fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count.min(64));
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor) {
                Ok(next) => {
                    out.push(next);
                    cursor = next;
                }
                Err(_) => break,
            }
        }
        out
    }
}

impl FromStr for Schedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

#[derive(Clone, Copy)]
enum Unit {
    Second,
    Minute,
    Hour,
    Day,
}

fn truncate(t: NaiveDateTime, unit: Unit) -> Option<NaiveDateTime> {
    let date = t.date();
    match unit {
        Unit::Second => date.and_hms_opt(t.hour(), t.minute(), t.second()),
        Unit::Minute => date.and_hms_opt(t.hour(), t.minute(), 0),
        Unit::Hour => date.and_hms_opt(t.hour(), 0, 0),
        Unit::Day => date.and_hms_opt(0, 0, 0),
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(text: &str, field: Field) -> Result<FieldSet, String> {
    let (min, max) = field.bounds();
    let mut set = FieldSet(0);

    for item in text.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in {} field '{text}'", field.name()));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    format!("invalid step '{step}' in {} field", field.name())
                })?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", field.name()));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, field)?;
            let hi = parse_value(b, field)?;
            if lo > hi {
                return Err(format!("reversed range '{range}' in {} field", field.name()));
            }
            (lo, hi)
        } else {
            let value = parse_value(range, field)?;
            // `a/n` means "from a to the end of the field, every n".
            if step.is_some() {
                (value, max)
            } else {
                (value, value)
            }
        };

        let step = step.unwrap_or(1);
        let mut value = lo;
        while value <= hi {
            set.insert(value);
            value = match value.checked_add(step) {
                Some(v) => v,
                None => break,
            };
        }
    }

    Ok(set)
}

fn parse_value(text: &str, field: Field) -> Result<u32, String> {
    let (min, max) = field.bounds();

    if let Some((names, offset)) = field.names() {
        let lower = text.to_ascii_lowercase();
        if let Some(idx) = names.iter().position(|n| *n == lower) {
            return Ok(idx as u32 + offset);
        }
    }

    let value: u32 = text
        .parse()
        .map_err(|_| format!("invalid value '{text}' in {} field", field.name()))?;
    if value < min || value > max {
        return Err(format!(
            "value {value} out of range {min}-{max} in {} field",
            field.name()
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_five_and_six_fields() {
        let five = Schedule::parse("*/5 * * * *").unwrap();
        assert!(!five.has_seconds());
        let six = Schedule::parse("30 */5 * * * *").unwrap();
        assert!(six.has_seconds());
    }

    #[test]
    fn test_rejects_wrong_field_count() {
        for expr in ["", "* * * *", "* * * * * * *"] {
            let err = Schedule::parse(expr).unwrap_err();
            assert!(matches!(err, CronError::InvalidSchedule { .. }), "{expr}");
        }
    }

    #[test]
    fn test_rejects_out_of_range_and_malformed() {
        for expr in [
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
            "1,,2 * * * *",
            "61 * * * * *",
        ] {
            assert!(Schedule::parse(expr).is_err(), "{expr} should be rejected");
        }
    }

    #[test]
    fn test_step_wider_than_field_keeps_only_start() {
        let s = Schedule::parse("59/4294967295 * * * *").unwrap();
        let next = s.next_after(at("2025-03-10T12:03:00Z")).unwrap();
        assert_eq!(next, at("2025-03-10T12:59:00Z"));
        let next = s.next_after(next).unwrap();
        assert_eq!(next, at("2025-03-10T13:59:00Z"));
    }

    #[test]
    fn test_every_five_minutes() {
        let s = Schedule::parse("*/5 * * * *").unwrap();
        let next = s.next_after(at("2025-03-10T12:03:27Z")).unwrap();
        assert_eq!(next, at("2025-03-10T12:05:00Z"));
        let next = s.next_after(at("2025-03-10T12:05:00Z")).unwrap();
        assert_eq!(next, at("2025-03-10T12:10:00Z"));
    }

    #[test]
    fn test_next_is_deterministic_and_strictly_later() {
        let t = at("2025-06-01T00:00:00Z");
        for expr in ["* * * * *", "*/5 * * * *", "0 3 * * *", "*/10 * * * * *", "0 0 1 1 *"] {
            let s = Schedule::parse(expr).unwrap();
            let a = s.next_after(t).unwrap();
            let b = s.next_after(t).unwrap();
            assert_eq!(a, b, "{expr}");
            assert!(a > t, "{expr}");
        }
    }

    #[test]
    fn test_seconds_field() {
        let s = Schedule::parse("*/15 * * * * *").unwrap();
        assert_eq!(
            s.next_after(at("2025-01-01T00:00:14.900Z")).unwrap(),
            at("2025-01-01T00:00:15Z")
        );
        assert_eq!(
            s.next_after(at("2025-01-01T00:00:45Z")).unwrap(),
            at("2025-01-01T00:01:00Z")
        );
    }

    #[test]
    fn test_weekday_zero_and_seven_are_sunday() {
        let zero = Schedule::parse("0 4 * * 0").unwrap();
        let seven = Schedule::parse("0 4 * * 7").unwrap();
        let sun = Schedule::parse("0 4 * * SUN").unwrap();
        let from = at("2025-03-12T10:00:00Z"); // Wednesday
        let expected = at("2025-03-16T04:00:00Z");
        assert_eq!(zero.next_after(from).unwrap(), expected);
        assert_eq!(seven.next_after(from).unwrap(), expected);
        assert_eq!(sun.next_after(from).unwrap(), expected);
    }

    #[test]
    fn test_lists_ranges_and_names() {
        let s = Schedule::parse("0 9-17/4 * jan-mar mon,wed").unwrap();
        // Friday 2025-01-03 -> Monday 2025-01-06 09:00
        assert_eq!(
            s.next_after(at("2025-01-03T18:00:00Z")).unwrap(),
            at("2025-01-06T09:00:00Z")
        );
        assert_eq!(
            s.next_after(at("2025-01-06T09:00:00Z")).unwrap(),
            at("2025-01-06T13:00:00Z")
        );
    }

    #[test]
    fn test_day_and_weekday_are_conjunctive() {
        // The 13th that is also a Friday.
        let s = Schedule::parse("0 0 13 * 5").unwrap();
        assert_eq!(
            s.next_after(at("2025-01-01T00:00:00Z")).unwrap(),
            at("2025-06-13T00:00:00Z")
        );
    }

    #[test]
    fn test_leap_day_and_year_rollover() {
        let s = Schedule::parse("0 0 29 2 *").unwrap();
        assert_eq!(
            s.next_after(at("2025-03-01T00:00:00Z")).unwrap(),
            at("2028-02-29T00:00:00Z")
        );
        let s = Schedule::parse("0 0 1 1 *").unwrap();
        assert_eq!(
            s.next_after(at("2025-12-31T23:59:59Z")).unwrap(),
            at("2026-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_impossible_date_hits_horizon() {
        let s = Schedule::parse("0 0 30 2 *").unwrap();
        let err = s.next_after(at("2025-01-01T00:00:00Z")).unwrap_err();
        assert_eq!(err, CronError::NoUpcomingFireTime("0 0 30 2 *".to_string()));
    }

    #[test]
    fn test_upcoming_lists_consecutive_fires() {
        let s = Schedule::parse("0 */6 * * *").unwrap();
        let runs = s.upcoming(at("2025-01-01T01:00:00Z"), 3);
        assert_eq!(
            runs,
            vec![
                at("2025-01-01T06:00:00Z"),
                at("2025-01-01T12:00:00Z"),
                at("2025-01-01T18:00:00Z"),
            ]
        );
    }

    #[test]
    fn test_normalizes_whitespace() {
        let s: Schedule = "  */5   *  * * * ".parse().unwrap();
        assert_eq!(s.to_string(), "*/5 * * * *");
    }
}
