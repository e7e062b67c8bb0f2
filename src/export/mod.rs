//! Export module for CSV and JSON downloads
//!
//! Renders an aggregated series into an in-memory document served by the
//! export endpoint.

pub mod csv_export;
pub mod json_export;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::AggregationResult;

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Invalid export format: {0}. Use 'csv' or 'json'")]
    InvalidFormat(String),

    #[error("Failed to write CSV record: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to flush export buffer: {0}")]
    Io(#[from] std::io::Error),
}

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl std::str::FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(ExportError::InvalidFormat(s.to_string())),
        }
    }
}

impl ExportFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }
}

/// A rendered download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDocument {
    pub format: ExportFormat,
    pub filename: String,
    pub body: Vec<u8>,
}

/// Filename derived from the series range, e.g. `analytics_20250601_20250620.csv`
pub fn export_filename(result: &AggregationResult, format: ExportFormat) -> String {
    format!(
        "analytics_{}_{}.{}",
        result.range.from.format("%Y%m%d"),
        result.range.to.format("%Y%m%d"),
        format.extension()
    )
}

/// Amount as written to exports: two decimal places, half away from zero
pub(crate) fn format_amount(value: Decimal) -> String {
    value
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .to_string()
}

/// Render a series in the requested format
pub fn render(result: &AggregationResult, format: ExportFormat) -> Result<ExportDocument, ExportError> {
    let body = match format {
        ExportFormat::Csv => csv_export::write_series_csv(result)?,
        ExportFormat::Json => json_export::write_series_json(result)?,
    };

    Ok(ExportDocument {
        format,
        filename: export_filename(result, format),
        body,
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_format_from_str() {
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!(matches!(
            "xml".parse::<ExportFormat>(),
            Err(ExportError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_export_format_extension() {
        assert_eq!(ExportFormat::Csv.extension(), "csv");
        assert_eq!(ExportFormat::Json.extension(), "json");
        assert_eq!(ExportFormat::default(), ExportFormat::Csv);
    }

    #[test]
    fn test_export_filename_uses_range() {
        let result = fixtures::sample_result();
        assert_eq!(
            export_filename(&result, ExportFormat::Json),
            "analytics_20250601_20250610.json"
        );
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount("4200.125".parse().unwrap()), "4200.13");
        assert_eq!(format_amount("12".parse().unwrap()), "12");
    }

    #[test]
    fn test_render_is_deterministic() {
        let result = fixtures::sample_result();
        let first = render(&result, ExportFormat::Json).unwrap();
        let second = render(&result, ExportFormat::Json).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.format, ExportFormat::Json);
    }
}
