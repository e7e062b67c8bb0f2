//! Period planning
//!
//! Turns a requested date range into the ordered bucket list of a series:
//! - Resolves the default trailing window when ends are missing
//! - Chooses week or month granularity from the span of the range
//! - Builds contiguous, non-overlapping buckets clamped to the range

pub mod dates;
pub mod monthly;
pub mod weekly;

use chrono::{Months, NaiveDate};
use thiserror::Error;

use crate::models::{DateRange, Granularity, Period};

/// Ranges spanning at most this many days are bucketed by week
pub const WEEKLY_THRESHOLD_DAYS: i64 = 120;

/// Upper bound on week buckets for a single series
pub const MAX_WEEK_BUCKETS: usize = 20;

/// Number of month buckets in the default trailing window
pub const DEFAULT_WINDOW_MONTHS: u32 = 12;

/// Invalid requested range
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RangeError {
    #[error("date_from {from} is after date_to {to}")]
    Inverted { from: NaiveDate, to: NaiveDate },

    #[error("date {0} is outside the supported calendar range")]
    OutOfRange(NaiveDate),
}

/// Fill in missing ends of a requested range.
///
/// A missing `to` means today. A missing `from` means the first day of the
/// month eleven months before `to`, giving a twelve-bucket monthly series.
pub fn resolve_range(
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<DateRange, RangeError> {
    let to = to.unwrap_or(today);
    let from = match from {
        Some(from) => from,
        None => to
            .checked_sub_months(Months::new(DEFAULT_WINDOW_MONTHS - 1))
            .map(monthly::month_start)
            .ok_or(RangeError::OutOfRange(to))?,
    };

    if from > to {
        return Err(RangeError::Inverted { from, to });
    }

    Ok(DateRange { from, to })
}

/// Choose bucket size from the span of the range
pub fn select_granularity(range: &DateRange) -> Granularity {
    if range.days_diff() <= WEEKLY_THRESHOLD_DAYS {
        Granularity::Week
    } else {
        Granularity::Month
    }
}

/// Build the ordered bucket list for a range.
///
/// `today` only affects labels: the month bucket holding today is labelled
/// with today's date so the in-progress month reads as a live point.
pub fn plan_periods(range: &DateRange, today: NaiveDate) -> Vec<Period> {
    match select_granularity(range) {
        Granularity::Week => weekly::build_week_periods(range),
        Granularity::Month => monthly::build_month_periods(range, today),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn range(from: NaiveDate, to: NaiveDate) -> DateRange {
        DateRange { from, to }
    }

    fn assert_contiguous(periods: &[Period], range: &DateRange) {
        assert!(!periods.is_empty());
        assert_eq!(periods[0].start, range.from);
        assert!(periods.last().unwrap().end <= range.to);
        for pair in periods.windows(2) {
            assert!(pair[0].start <= pair[0].end);
            assert_eq!(pair[0].end + Duration::days(1), pair[1].start);
        }
    }

    #[test]
    fn test_granularity_boundary_at_120_days() {
        let from = date(2025, 1, 1);
        assert_eq!(
            select_granularity(&range(from, from + Duration::days(120))),
            Granularity::Week
        );
        assert_eq!(
            select_granularity(&range(from, from + Duration::days(121))),
            Granularity::Month
        );
    }

    #[test]
    fn test_nineteen_day_range_yields_three_weeks() {
        let r = range(date(2025, 6, 1), date(2025, 6, 20));
        let periods = plan_periods(&r, date(2025, 6, 20));

        assert_eq!(periods.len(), 3);
        assert!(periods.iter().all(|p| p.granularity == Granularity::Week));
        assert_eq!(periods[0].days(), 7);
        assert_eq!(periods[1].days(), 7);
        assert_eq!(periods[2].end, date(2025, 6, 20));
        assert_contiguous(&periods, &r);
    }

    #[test]
    fn test_plans_are_contiguous_for_many_ranges() {
        let today = date(2025, 10, 19);
        let start = date(2024, 2, 27);
        for span in [0, 1, 6, 7, 8, 30, 119, 120, 121, 200, 365, 800] {
            let r = range(start, start + Duration::days(span));
            let periods = plan_periods(&r, today);
            assert_contiguous(&periods, &r);
            assert_eq!(periods.last().unwrap().end, r.to, "span {}", span);
        }
    }

    #[test]
    fn test_resolve_range_defaults_to_trailing_twelve_months() {
        let today = date(2025, 10, 19);
        let r = resolve_range(None, None, today).unwrap();

        assert_eq!(r.to, today);
        assert_eq!(r.from, date(2024, 11, 1));

        let periods = plan_periods(&r, today);
        assert_eq!(periods.len(), 12);
        assert_eq!(periods[0].granularity, Granularity::Month);
    }

    #[test]
    fn test_resolve_range_uses_explicit_ends() {
        let today = date(2025, 10, 19);
        let r = resolve_range(Some(date(2025, 6, 1)), Some(date(2025, 6, 20)), today).unwrap();
        assert_eq!(r, range(date(2025, 6, 1), date(2025, 6, 20)));

        let open_ended = resolve_range(Some(date(2025, 9, 1)), None, today).unwrap();
        assert_eq!(open_ended.to, today);
    }

    #[test]
    fn test_resolve_range_rejects_inverted_range() {
        let today = date(2025, 10, 19);
        let err = resolve_range(Some(date(2025, 7, 1)), Some(date(2025, 6, 1)), today).unwrap_err();
        assert_eq!(
            err,
            RangeError::Inverted {
                from: date(2025, 7, 1),
                to: date(2025, 6, 1)
            }
        );

        // Start in the future with no end resolves `to` to today
        assert!(resolve_range(Some(date(2025, 12, 1)), None, today).is_err());
    }

    #[test]
    fn test_single_day_range_yields_one_week_bucket() {
        let day = date(2025, 6, 5);
        let periods = plan_periods(&range(day, day), day);
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].start, day);
        assert_eq!(periods[0].end, day);
    }
}
