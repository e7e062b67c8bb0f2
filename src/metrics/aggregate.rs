//! Per-bucket metric values
//!
//! Flow values sum every record dated inside a bucket. Stock values take the
//! latest observation at or before the bucket end.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{ExternalRecord, MetricKey, Period, Snapshot, SnapshotOrigin};

/// How a bucket value was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrigin {
    /// Computed from records fetched in this request
    Observed,
    /// Taken verbatim from a previously stored snapshot
    Stored(SnapshotOrigin),
    /// Synthesized by the backfill ramp
    Backfilled,
    /// Zero standing in for a bucket whose fetch failed
    Placeholder,
}

/// A computed value for one bucket of one metric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketValue {
    pub value: Decimal,
    pub count: Option<u32>,
    pub origin: ValueOrigin,
}

impl BucketValue {
    pub fn observed(value: Decimal, count: u32) -> Self {
        Self {
            value,
            count: Some(count),
            origin: ValueOrigin::Observed,
        }
    }

    pub fn placeholder() -> Self {
        Self {
            value: Decimal::ZERO,
            count: None,
            origin: ValueOrigin::Placeholder,
        }
    }

    pub fn backfilled(value: Decimal) -> Self {
        Self {
            value,
            count: None,
            origin: ValueOrigin::Backfilled,
        }
    }

    /// Reuse a stored snapshot as-is
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            value: snapshot.value,
            count: snapshot.count,
            origin: ValueOrigin::Stored(snapshot.origin),
        }
    }

    /// True for values backed by a real observation, now or in the past
    pub fn is_observed(&self) -> bool {
        matches!(
            self.origin,
            ValueOrigin::Observed | ValueOrigin::Stored(SnapshotOrigin::Observed)
        )
    }

    /// Origin to record when this value is persisted; placeholders are never stored
    pub fn snapshot_origin(&self) -> Option<SnapshotOrigin> {
        match self.origin {
            ValueOrigin::Observed => Some(SnapshotOrigin::Observed),
            ValueOrigin::Backfilled => Some(SnapshotOrigin::Backfilled),
            ValueOrigin::Stored(origin) => Some(origin),
            ValueOrigin::Placeholder => None,
        }
    }
}

/// Sum a flow metric's records dated within the bucket
pub fn flow_value(period: &Period, metric: &MetricKey, records: &[ExternalRecord]) -> BucketValue {
    let mut total = Decimal::ZERO;
    let mut count = 0u32;

    for record in records
        .iter()
        .filter(|r| &r.category == metric && period.contains(r.timestamp))
    {
        total += record.amount;
        count = count.saturating_add(1);
    }

    BucketValue::observed(total, count)
}

/// A stock metric's known values, keyed by observation time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockObservations {
    points: BTreeMap<DateTime<Utc>, (Decimal, u32)>,
}

impl StockObservations {
    /// Group a metric's records by timestamp; each timestamp is one observation
    pub fn from_records(metric: &MetricKey, records: &[ExternalRecord]) -> Self {
        let mut points: BTreeMap<DateTime<Utc>, (Decimal, u32)> = BTreeMap::new();
        for record in records.iter().filter(|r| &r.category == metric) {
            let point = points
                .entry(record.timestamp)
                .or_insert((Decimal::ZERO, 0));
            point.0 += record.amount;
            point.1 = point.1.saturating_add(1);
        }
        Self { points }
    }

    /// Record an observation explicitly, e.g. an empty stage seen at fetch time
    pub fn observe(&mut self, at: DateTime<Utc>, value: Decimal, count: u32) {
        self.points.insert(at, (value, count));
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Most recent observation overall
    pub fn latest(&self) -> Option<(DateTime<Utc>, Decimal)> {
        self.points.iter().next_back().map(|(at, (v, _))| (*at, *v))
    }

    /// Latest observation at or before the end of the bucket
    pub fn value_at_end_of(&self, period: &Period) -> Option<BucketValue> {
        self.points
            .range(..period.end_exclusive())
            .next_back()
            .map(|(_, (value, count))| BucketValue::observed(*value, *count))
    }
}
