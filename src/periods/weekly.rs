//! Week bucket construction
//!
//! Weeks are anchored at the range start rather than a calendar Monday, so
//! a short range always begins with a full seven-day bucket.

use chrono::Duration;

use super::dates::day_label;
use super::MAX_WEEK_BUCKETS;
use crate::models::{DateRange, Granularity, Period};

/// Build seven-day buckets from `range.from`, truncating the last to `range.to`
pub fn build_week_periods(range: &DateRange) -> Vec<Period> {
    let mut periods = Vec::new();
    let mut start = range.from;

    while periods.len() < MAX_WEEK_BUCKETS {
        let end = (start + Duration::days(6)).min(range.to);
        let covers_end = end >= range.to;

        // The bucket holding the range end is labelled with that end date
        let label = if covers_end {
            day_label(range.to)
        } else {
            day_label(start)
        };

        periods.push(Period {
            start,
            end,
            granularity: Granularity::Week,
            label,
        });

        if covers_end {
            break;
        }
        start = end + Duration::days(1);
    }

    periods
}
