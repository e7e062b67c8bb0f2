//! Month bucket construction
//!
//! Buckets follow calendar months, with the first and last clamped to the
//! requested range.

use chrono::{Datelike, Duration, Months, NaiveDate};

use super::dates::{day_label, month_label};
use crate::models::{DateRange, Granularity, Period};

/// Get the first day of the month for a date
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Get the last day of the month for a date
pub fn month_end(date: NaiveDate) -> NaiveDate {
    month_start(date)
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

/// Build one bucket per calendar month touched by the range
pub fn build_month_periods(range: &DateRange, today: NaiveDate) -> Vec<Period> {
    let mut periods = Vec::new();
    let mut cursor = month_start(range.from);

    while cursor <= range.to {
        let start = cursor.max(range.from);
        let end = month_end(cursor).min(range.to);

        let label = if today >= cursor && today <= month_end(cursor) {
            day_label(today)
        } else {
            month_label(cursor)
        };

        periods.push(Period {
            start,
            end,
            granularity: Granularity::Month,
            label,
        });

        cursor = month_end(cursor) + Duration::days(1);
    }

    periods
}
