//! Date parsing and label formatting helpers

use chrono::NaiveDate;

/// Parse a date string in YYYY-MM-DD format
pub fn parse_date(date_str: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d").ok()
}

/// Format a date as YYYY-MM-DD
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Short day label, e.g. "Jun 8"
pub fn day_label(date: NaiveDate) -> String {
    date.format("%b %-d").to_string()
}

/// Short month label, e.g. "Jun 25"
pub fn month_label(date: NaiveDate) -> String {
    date.format("%b %y").to_string()
}
