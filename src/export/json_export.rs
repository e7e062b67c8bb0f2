//! JSON export functionality
//!
//! Amounts are written as decimal strings so downloads keep exact cents.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{format_amount, ExportError};
use crate::models::{Granularity, MetricFamily, MetricKind};
use crate::periods::dates::format_date;
use crate::service::AggregationResult;

const EXPORT_VERSION: &str = "1.0";

/// Complete export structure for JSON
#[derive(Debug, Clone, Serialize)]
pub struct SeriesExportJson {
    pub export_version: &'static str,
    pub date_range: (String, String),
    pub granularity: Granularity,
    pub cached: bool,
    pub historical_data_points: usize,
    pub degraded_periods: Vec<String>,
    pub metrics: Vec<MetricExportJson>,
    pub periods: Vec<PeriodExportJson>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricExportJson {
    pub key: String,
    pub label: String,
    pub kind: MetricKind,
    pub family: MetricFamily,
    pub total: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodExportJson {
    pub label: String,
    pub start: String,
    pub end: String,
    pub values: BTreeMap<String, String>,
}

impl From<&AggregationResult> for SeriesExportJson {
    fn from(result: &AggregationResult) -> Self {
        Self {
            export_version: EXPORT_VERSION,
            date_range: (format_date(result.range.from), format_date(result.range.to)),
            granularity: result.granularity,
            cached: result.cached,
            historical_data_points: result.historical_data_points,
            degraded_periods: result.degraded_periods.clone(),
            metrics: result
                .metrics
                .iter()
                .map(|m| MetricExportJson {
                    key: m.key.to_string(),
                    label: m.label.clone(),
                    kind: m.kind,
                    family: m.family,
                    total: format_amount(m.total),
                })
                .collect(),
            periods: result
                .periods
                .iter()
                .map(|p| PeriodExportJson {
                    label: p.label.clone(),
                    start: format_date(p.start),
                    end: format_date(p.end),
                    values: p
                        .values
                        .iter()
                        .map(|(k, v)| (k.to_string(), format_amount(*v)))
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Write a series to pretty-printed JSON bytes
pub fn write_series_json(result: &AggregationResult) -> Result<Vec<u8>, ExportError> {
    let export = SeriesExportJson::from(result);
    Ok(serde_json::to_vec_pretty(&export)?)
}
