//! Records fetched from external sources

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::MetricKey;

/// A single amount reported by an external source.
///
/// `timestamp` is the record's effective date: a deal's close date, the date
/// a stage was observed, or the first day of a report window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub category: MetricKey,
}

impl ExternalRecord {
    pub fn new(category: MetricKey, amount: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            amount,
            timestamp,
            category,
        }
    }
}
