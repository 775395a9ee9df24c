//! Timestamp helpers.
//!
//! All persisted timestamps are fixed-width ISO-8601 UTC text
//! (`2026-08-02T12:00:00.000Z`) so that lexical comparison inside SQL
//! matches chronological order.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

pub fn format_iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_iso() -> String {
    format_iso(Utc::now())
}

pub fn iso_days_ago(days: i64) -> String {
    format_iso(Utc::now() - Duration::days(days))
}

pub fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whole minutes elapsed since `raw`, or `None` if it does not parse.
pub fn minutes_since(raw: &str, now: DateTime<Utc>) -> Option<i64> {
    parse_iso(raw).map(|at| (now - at).num_minutes())
}
