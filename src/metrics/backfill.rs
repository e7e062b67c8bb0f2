//! Historical backfill for stock metrics
//!
//! Stock sources only report the live value, so older buckets have no real
//! observation. Those buckets take a stored snapshot when one exists and a
//! point on a deterministic ramp toward the live value otherwise.

use rust_decimal::Decimal;

use super::aggregate::BucketValue;
use crate::models::Snapshot;

/// Default share of the live value used for the oldest bucket
const DEFAULT_BASELINE_FRACTION: Decimal = Decimal::from_parts(3, 0, 0, false, 1);

/// Linear ramp from `baseline_fraction * live` (oldest bucket) to `live`
/// (newest bucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRamp {
    baseline_fraction: Decimal,
}

impl Default for BackfillRamp {
    fn default() -> Self {
        Self {
            baseline_fraction: DEFAULT_BASELINE_FRACTION,
        }
    }
}

impl BackfillRamp {
    /// Create a ramp; fractions outside [0, 1] fall back to the default
    pub fn new(baseline_fraction: f64) -> Self {
        match Decimal::try_from(baseline_fraction) {
            Ok(fraction) if fraction >= Decimal::ZERO && fraction <= Decimal::ONE => Self {
                baseline_fraction: fraction,
            },
            _ => {
                tracing::warn!(
                    "Baseline fraction {} out of range, using {}",
                    baseline_fraction,
                    DEFAULT_BASELINE_FRACTION
                );
                Self::default()
            }
        }
    }

    pub fn baseline_fraction(&self) -> Decimal {
        self.baseline_fraction
    }

    /// Synthetic value for bucket `index` of `bucket_count`.
    ///
    /// The newest bucket is exactly `live`.
    pub fn value_at(&self, live: Decimal, index: usize, bucket_count: usize) -> Decimal {
        if bucket_count <= 1 || index + 1 >= bucket_count {
            return live;
        }

        let baseline = live * self.baseline_fraction;
        let growth = live - baseline;
        let progress = Decimal::from(index as u64) / Decimal::from((bucket_count - 1) as u64);

        (baseline + growth * progress).round_dp(2)
    }

    /// Complete a stock series.
    ///
    /// Per bucket, in order of preference: a value observed in this request,
    /// a stored snapshot used verbatim, the live value for the newest bucket,
    /// a ramp point.
    pub fn fill(
        &self,
        live: Decimal,
        observed: &[Option<BucketValue>],
        stored: &[Option<Snapshot>],
    ) -> Vec<BucketValue> {
        let bucket_count = observed.len();

        observed
            .iter()
            .enumerate()
            .map(|(index, value)| {
                if let Some(value) = value {
                    return value.clone();
                }
                if let Some(snapshot) = stored.get(index).and_then(Option::as_ref) {
                    return BucketValue::from_snapshot(snapshot);
                }
                BucketValue::backfilled(self.value_at(live, index, bucket_count))
            })
            .collect()
    }
}
