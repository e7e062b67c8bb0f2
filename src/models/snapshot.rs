//! Cached per-bucket metric values

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Granularity, MetricFamily, MetricKey, Period};

/// Cache key of one (bucket, metric) value
///
/// The bucket end is part of the key: a truncated bucket and a full bucket
/// sharing a start date are different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub family: MetricFamily,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub granularity: Granularity,
    pub metric: MetricKey,
}

impl SnapshotKey {
    pub fn for_period(family: MetricFamily, period: &Period, metric: &MetricKey) -> Self {
        Self {
            family,
            period_start: period.start,
            period_end: period.end,
            granularity: period.granularity,
            metric: metric.clone(),
        }
    }
}

/// Where a stored value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOrigin {
    /// Computed from records returned by a source
    Observed,
    /// Synthesized by the backfill ramp
    Backfilled,
}

impl SnapshotOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotOrigin::Observed => "observed",
            SnapshotOrigin::Backfilled => "backfilled",
        }
    }
}

impl FromStr for SnapshotOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observed" => Ok(SnapshotOrigin::Observed),
            "backfilled" => Ok(SnapshotOrigin::Backfilled),
            other => Err(format!("Invalid snapshot origin: {}", other)),
        }
    }
}

/// Stored value for one bucket and metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub value: Decimal,
    pub count: Option<u32>,
    pub origin: SnapshotOrigin,
    pub cached_at: DateTime<Utc>,
}

impl Snapshot {
    /// A snapshot is fresh while `now - cached_at` is below the ttl
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.cached_at < ttl
    }
}
