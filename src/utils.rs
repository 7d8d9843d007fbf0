use crate::error::{PipelineError, Result};
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime};

/// Full-date layouts tried in order. Slash dates are read month-first,
/// with day-first accepted only when month-first cannot parse.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d/%m/%Y", "%d.%m.%Y"];

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn next_month_start(date: NaiveDate) -> Result<NaiveDate> {
    add_months(date, 1)
}

/// Adds `count` months to the first day of `date`'s month.
pub fn add_months(date: NaiveDate, count: u32) -> Result<NaiveDate> {
    first_of_month(date)
        .checked_add_months(Months::new(count))
        .ok_or_else(|| {
            PipelineError::DateError(format!("Cannot add {} months to {}", count, date))
        })
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Every first-of-month date from `start`'s month through `end`'s month.
pub fn month_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
    let mut months = Vec::new();
    let last = first_of_month(end);
    let mut current = first_of_month(start);

    while current <= last {
        months.push(current);
        current = next_month_start(current)?;
    }

    Ok(months)
}

/// Parses the date layouts found in dealership exports.
pub fn parse_flexible_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::DateError("Empty date".to_string()));
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(date);
        }
    }

    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(datetime.date());
        }
    }

    if let Ok(datetime) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(datetime.date_naive());
    }

    if let Some(date) = parse_month_only(trimmed) {
        return Ok(date);
    }

    Err(PipelineError::DateError(format!(
        "Unrecognized date format: '{}'",
        trimmed
    )))
}

// "2023-01", "2023/01", "202301", "20230115", "Jan 2023", "January 2023"
fn parse_month_only(raw: &str) -> Option<NaiveDate> {
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return match raw.len() {
            6 => NaiveDate::from_ymd_opt(raw[0..4].parse().ok()?, raw[4..6].parse().ok()?, 1),
            8 => NaiveDate::from_ymd_opt(
                raw[0..4].parse().ok()?,
                raw[4..6].parse().ok()?,
                raw[6..8].parse().ok()?,
            ),
            _ => None,
        };
    }

    NaiveDate::parse_from_str(&format!("{}-01", raw), "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}/01", raw), "%Y/%m/%d"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("01 {}", raw), "%d %B %Y"))
        .ok()
}

/// Coerces a loosely formatted amount ("$1,234.50", "(250)", "12.5%") to a
/// finite float. Returns `None` for empty or non-numeric input.
pub fn parse_numeric(raw: &str) -> Option<f64> {
    let mut text = raw.trim();
    if text.is_empty() {
        return None;
    }

    let negative = text.starts_with('(') && text.ends_with(')');
    if negative {
        text = &text[1..text.len() - 1];
    }

    let cleaned: String = text
        .trim()
        .trim_end_matches('%')
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' ' | '\u{a0}'))
        .collect();

    let value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    Some(if negative { -value } else { value })
}

/// Lower-cases a KPI label and collapses runs of whitespace.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
