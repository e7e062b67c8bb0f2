//! Time buckets and requested date ranges

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Bucket size chosen for a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            other => Err(format!("Invalid granularity: {}", other)),
        }
    }
}

/// Inclusive calendar-date range requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    /// Whole days between the two ends (0 for a single-day range)
    pub fn days_diff(&self) -> i64 {
        (self.to - self.from).num_days()
    }
}

/// One contiguous bucket of a series.
///
/// `start` and `end` are both inclusive calendar dates; the next bucket starts
/// the day after `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: Granularity,
    pub label: String,
}

impl Period {
    /// Check whether a timestamp falls on one of this bucket's days
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        let date = timestamp.date_naive();
        date >= self.start && date <= self.end
    }

    /// Number of calendar days covered
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// First instant of the bucket
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start.and_time(NaiveTime::MIN).and_utc()
    }

    /// First instant after the bucket (exclusive bound)
    pub fn end_exclusive(&self) -> DateTime<Utc> {
        self.end
            .checked_add_days(Days::new(1))
            .unwrap_or(self.end)
            .and_time(NaiveTime::MIN)
            .and_utc()
    }
}
