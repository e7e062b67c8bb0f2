//! Metric identity and static classification

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Stable identifier of a metric, e.g. `revenue` or `advanced-negotiations`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricKey(String);

impl MetricKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MetricKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Aggregation semantics of a metric.
///
/// A stock is an amount as of a point in time (pipeline value), a flow is an
/// amount accumulated during an interval (revenue recognized in a month).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Stock,
    Flow,
}

impl MetricKind {
    /// Roll per-bucket values into the total displayed for the whole range.
    ///
    /// Flows are summed. Stocks report the last bucket only; summing a stock
    /// across buckets counts the same pipeline once per bucket.
    pub fn rollup(&self, bucket_values: &[Decimal]) -> Decimal {
        match self {
            MetricKind::Flow => bucket_values.iter().copied().sum(),
            MetricKind::Stock => bucket_values.last().copied().unwrap_or(Decimal::ZERO),
        }
    }
}

/// Group of metrics served by one external source.
///
/// Cache freshness is decided per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFamily {
    /// CRM deal pipeline search
    Pipeline,
    /// Accounting profit and loss report
    Financial,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 2] = [MetricFamily::Pipeline, MetricFamily::Financial];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::Pipeline => "pipeline",
            MetricFamily::Financial => "financial",
        }
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pipeline" => Ok(MetricFamily::Pipeline),
            "financial" => Ok(MetricFamily::Financial),
            _ => Err(format!(
                "Unknown metric family: {}. Use 'pipeline' or 'financial'",
                s
            )),
        }
    }
}

/// How a source extracts records for a metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selector {
    /// Deals currently (or, when `dated`, closed within the window) in a stage
    DealStage { stage_id: String, dated: bool },
    /// Rows of the profit and loss report classified under this metric's key
    ReportCategory,
}

/// Registry entry describing one metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub key: MetricKey,
    pub label: String,
    pub kind: MetricKind,
    pub family: MetricFamily,
    pub selector: Selector,
}

impl MetricDefinition {
    pub fn is_stock(&self) -> bool {
        self.kind == MetricKind::Stock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(values: &[i64]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from(*v)).collect()
    }

    #[test]
    fn test_flow_rollup_sums_buckets() {
        let total = MetricKind::Flow.rollup(&dec(&[100, 200, 0, 300]));
        assert_eq!(total, Decimal::from(600));
    }

    #[test]
    fn test_stock_rollup_takes_last_bucket() {
        let values = dec(&[100, 200, 150, 180]);
        let total = MetricKind::Stock.rollup(&values);
        assert_eq!(total, Decimal::from(180));

        // Regression guard: never the sum for non-uniform buckets
        let sum: Decimal = values.iter().copied().sum();
        assert_ne!(total, sum);
    }

    #[test]
    fn test_rollup_of_empty_series_is_zero() {
        assert_eq!(MetricKind::Flow.rollup(&[]), Decimal::ZERO);
        assert_eq!(MetricKind::Stock.rollup(&[]), Decimal::ZERO);
    }

    #[test]
    fn test_metric_family_from_str() {
        assert_eq!("pipeline".parse::<MetricFamily>(), Ok(MetricFamily::Pipeline));
        assert_eq!("FINANCIAL".parse::<MetricFamily>(), Ok(MetricFamily::Financial));
        assert!("crm".parse::<MetricFamily>().is_err());
    }

    #[test]
    fn test_metric_kind_serialization() {
        assert_eq!(serde_json::to_string(&MetricKind::Stock).unwrap(), "\"stock\"");
        assert_eq!(serde_json::to_string(&MetricKind::Flow).unwrap(), "\"flow\"");
    }

    #[test]
    fn test_selector_deserialization() {
        let selector: Selector =
            serde_json::from_str(r#"{"type":"deal_stage","stage_id":"closedwon","dated":true}"#)
                .unwrap();
        assert_eq!(
            selector,
            Selector::DealStage {
                stage_id: "closedwon".to_string(),
                dated: true
            }
        );
    }
}
