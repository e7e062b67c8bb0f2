//! Wire shapes of the analytics endpoints
//!
//! Amounts are exact decimals internally and rounded to two places here.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::models::{Granularity, MetricFamily, MetricKind};
use crate::periods::dates::format_date;
use crate::service::{AggregationRequest, AggregationResult};

/// Query string of `GET /api/analytics`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsQuery {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub refresh: Option<String>,
    pub family: Option<String>,
}

/// Query string of `GET /api/analytics/export`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub refresh: Option<String>,
    pub family: Option<String>,
}

impl ExportQuery {
    pub fn analytics(&self) -> AnalyticsQuery {
        AnalyticsQuery {
            date_from: self.date_from.clone(),
            date_to: self.date_to.clone(),
            refresh: self.refresh.clone(),
            family: self.family.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsResponse {
    pub success: bool,
    pub data: Vec<MetricSeriesDto>,
    pub metadata: MetadataDto,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSeriesDto {
    pub key: String,
    pub label: String,
    pub kind: MetricKind,
    pub family: MetricFamily,
    /// Range total: sum of buckets for flows, last bucket for stocks
    pub value: f64,
    pub data: Vec<DataPointDto>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataPointDto {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDto {
    pub granularity: Granularity,
    pub historical_data_points: usize,
    pub filters_applied: FiltersDto,
    pub data_range: DataRangeDto,
    pub cached: bool,
    pub degraded_periods: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FiltersDto {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub refresh: bool,
    pub family: Option<MetricFamily>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataRangeDto {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Display value rounded to cents
pub fn display_value(value: Decimal) -> f64 {
    value
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(0.0)
}

impl AnalyticsResponse {
    pub fn from_result(result: &AggregationResult, request: &AggregationRequest) -> Self {
        let data = result
            .metrics
            .iter()
            .map(|metric| MetricSeriesDto {
                key: metric.key.to_string(),
                label: metric.label.clone(),
                kind: metric.kind,
                family: metric.family,
                value: display_value(metric.total),
                data: result
                    .periods
                    .iter()
                    .map(|period| DataPointDto {
                        name: period.label.clone(),
                        value: display_value(
                            period
                                .values
                                .get(&metric.key)
                                .copied()
                                .unwrap_or(Decimal::ZERO),
                        ),
                    })
                    .collect(),
            })
            .collect();

        Self {
            success: true,
            data,
            metadata: MetadataDto {
                granularity: result.granularity,
                historical_data_points: result.historical_data_points,
                filters_applied: FiltersDto {
                    date_from: request.date_from.map(format_date),
                    date_to: request.date_to.map(format_date),
                    refresh: request.force_refresh,
                    family: request.family,
                },
                data_range: DataRangeDto {
                    from: format_date(result.range.from),
                    to: format_date(result.range.to),
                },
                cached: result.cached,
                degraded_periods: result.degraded_periods.clone(),
            },
        }
    }
}
