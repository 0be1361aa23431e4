//! Natural-language time expression parser
//!
//! Grammar:
//! - Absolute: RFC 3339; `YYYY-MM-DD`; `YYYY-MM-DD HH:MM[:SS]` (process
//!   local time unless suffixed `Z`)
//! - Relative: `N (second|minute|hour|day|week|month|year)s? ago`,
//!   `yesterday`, `today`, `last (week|month|year)`, `this (week|month|year)`
//! - Ranges: `between <T1> and <T2>`, `since <T>`, `before <T>`
//!
//! Day-level tokens expand to 00:00:00..23:59:59. Every point expression
//! parses to a range; instants collapse to a zero-width range.

use chrono::{
    DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc,
};

use crate::error::{MnemoError, Result};
use crate::identity;
use crate::types::TimeRange;

/// Parse a full time query into an inclusive range.
pub fn parse_time_query(input: &str) -> Result<TimeRange> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(MnemoError::InvalidInput(
            "empty time expression".to_string(),
        ));
    }
    // The grammar is ASCII keywords plus numeric dates, so lowercasing is
    // safe for every parse path (RFC 3339 accepts lowercase t/z).
    let lower = trimmed.to_lowercase();

    if let Some(rest) = lower.strip_prefix("between ") {
        let (first, second) = rest.split_once(" and ").ok_or_else(|| {
            MnemoError::InvalidInput(format!(
                "'between' expression missing 'and': '{trimmed}'"
            ))
        })?;
        let start = parse_point(first.trim())?;
        let end = parse_point(second.trim())?;
        if start.start > end.end {
            return Err(MnemoError::InvalidInput(format!(
                "time range is inverted: '{trimmed}'"
            )));
        }
        return Ok(TimeRange::new(start.start, end.end));
    }

    if let Some(rest) = lower.strip_prefix("since ") {
        let point = parse_point(rest.trim())?;
        return Ok(TimeRange::new(point.start, identity::now()));
    }

    if let Some(rest) = lower.strip_prefix("before ") {
        let point = parse_point(rest.trim())?;
        return Ok(TimeRange::new(0.0, point.start));
    }

    parse_point(&lower)
}

/// Parse a point expression. Day-level points expand to the whole day.
fn parse_point(expr: &str) -> Result<TimeRange> {
    if expr.is_empty() {
        return Err(MnemoError::InvalidInput(
            "empty time expression".to_string(),
        ));
    }

    let today = Local::now().date_naive();
    match expr {
        "today" => return Ok(day_range(today)),
        "yesterday" => return Ok(day_range(today - Duration::days(1))),
        "this week" => {
            let start = week_start(today);
            return Ok(TimeRange::new(start_of_day(start), identity::now()));
        }
        "last week" => {
            let start = week_start(today) - Duration::days(7);
            return Ok(TimeRange::new(
                start_of_day(start),
                end_of_day(start + Duration::days(6)),
            ));
        }
        "this month" => {
            let start = today.with_day(1).unwrap_or(today);
            return Ok(TimeRange::new(start_of_day(start), identity::now()));
        }
        "last month" => {
            let (year, month) = previous_month(today.year(), today.month());
            return Ok(month_range(year, month));
        }
        "this year" => {
            let start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
            return Ok(TimeRange::new(start_of_day(start), identity::now()));
        }
        "last year" => return Ok(year_range(today.year() - 1)),
        _ => {}
    }

    if let Some(range) = parse_relative_ago(expr, today)? {
        return Ok(range);
    }
    if let Some(range) = parse_absolute(expr)? {
        return Ok(range);
    }

    Err(MnemoError::InvalidInput(format!(
        "could not parse time expression '{expr}'"
    )))
}

/// `N <unit>s? ago`
fn parse_relative_ago(expr: &str, today: NaiveDate) -> Result<Option<TimeRange>> {
    let tokens: Vec<&str> = expr.split_whitespace().collect();
    if tokens.len() != 3 || tokens[2] != "ago" {
        return Ok(None);
    }
    let count: i64 = match tokens[0].parse() {
        Ok(n) => n,
        Err(_) => return Ok(None),
    };
    if count < 0 {
        return Err(MnemoError::InvalidInput(format!(
            "negative offset in '{expr}'"
        )));
    }

    let unit = tokens[1].trim_end_matches('s');
    let range = match unit {
        // Sub-day units: a one-unit-wide window ending at the offset point
        "second" => instant_window(count, 1),
        "minute" => instant_window(count * 60, 60),
        "hour" => instant_window(count * 3600, 3600),
        // Day-level units expand to calendar granularity
        "day" => day_range(today - Duration::days(count)),
        "week" => {
            let start = week_start(today - Duration::days(7 * count));
            TimeRange::new(start_of_day(start), end_of_day(start + Duration::days(6)))
        }
        "month" => {
            let mut year = today.year();
            let mut month = today.month();
            for _ in 0..count {
                let (y, m) = previous_month(year, month);
                year = y;
                month = m;
            }
            month_range(year, month)
        }
        "year" => year_range(today.year() - count as i32),
        _ => return Ok(None),
    };
    Ok(Some(range))
}

/// Window of `width` seconds ending `offset` seconds before now
fn instant_window(offset: i64, width: i64) -> TimeRange {
    let point = identity::now() - offset as f64;
    TimeRange::new(point, point + width as f64)
}

/// RFC 3339, `YYYY-MM-DD`, or `YYYY-MM-DD HH:MM[:SS]`
fn parse_absolute(expr: &str) -> Result<Option<TimeRange>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(expr) {
        let ts = dt.timestamp_micros() as f64 / 1_000_000.0;
        return Ok(Some(TimeRange::new(ts, ts)));
    }

    if let Ok(date) = NaiveDate::parse_from_str(expr, "%Y-%m-%d") {
        return Ok(Some(day_range(date)));
    }

    // `YYYY-MM-DD HH:MM[:SS]`, optionally suffixed `z` for UTC
    let (body, utc) = match expr.strip_suffix('z') {
        Some(stripped) => (stripped.trim_end(), true),
        None => (expr, false),
    };
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(body, format) {
            let ts = if utc {
                Utc.from_utc_datetime(&naive).timestamp_micros() as f64 / 1_000_000.0
            } else {
                local_timestamp(naive)
            };
            return Ok(Some(TimeRange::new(ts, ts)));
        }
    }

    Ok(None)
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn day_range(date: NaiveDate) -> TimeRange {
    TimeRange::new(start_of_day(date), end_of_day(date))
}

fn month_range(year: i32, month: u32) -> TimeRange {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, 1, 1).expect("valid date"));
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let last = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .map(|d| d - Duration::days(1))
        .unwrap_or(first);
    TimeRange::new(start_of_day(first), end_of_day(last))
}

fn year_range(year: i32) -> TimeRange {
    let first = NaiveDate::from_ymd_opt(year, 1, 1).expect("valid date");
    let last = NaiveDate::from_ymd_opt(year, 12, 31).expect("valid date");
    TimeRange::new(start_of_day(first), end_of_day(last))
}

fn start_of_day(date: NaiveDate) -> f64 {
    local_timestamp(date.and_hms_opt(0, 0, 0).expect("valid time"))
}

fn end_of_day(date: NaiveDate) -> f64 {
    local_timestamp(date.and_hms_opt(23, 59, 59).expect("valid time"))
}

fn local_timestamp(naive: NaiveDateTime) -> f64 {
    // DST gaps resolve to the earliest valid interpretation
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_micros() as f64 / 1_000_000.0)
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive).timestamp_micros() as f64 / 1_000_000.0)
}
