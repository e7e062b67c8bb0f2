//! CSV export functionality
//!
//! One row per period and one column per metric, followed by a totals row.

use csv::Writer;

use super::{format_amount, ExportError};
use crate::periods::dates::format_date;
use crate::service::AggregationResult;

/// Write a series to CSV bytes
pub fn write_series_csv(result: &AggregationResult) -> Result<Vec<u8>, ExportError> {
    let mut writer = Writer::from_writer(Vec::new());

    let mut header = vec![
        "period".to_string(),
        "start".to_string(),
        "end".to_string(),
    ];
    header.extend(result.metrics.iter().map(|m| m.key.to_string()));
    writer.write_record(&header)?;

    for period in &result.periods {
        let mut record = vec![
            period.label.clone(),
            format_date(period.start),
            format_date(period.end),
        ];
        record.extend(result.metrics.iter().map(|m| {
            period
                .values
                .get(&m.key)
                .map(|v| format_amount(*v))
                .unwrap_or_else(|| "0".to_string())
        }));
        writer.write_record(&record)?;
    }

    // Stocks total to their last bucket, flows to the sum
    let mut totals = vec![
        "Total".to_string(),
        format_date(result.range.from),
        format_date(result.range.to),
    ];
    totals.extend(result.metrics.iter().map(|m| format_amount(m.total)));
    writer.write_record(&totals)?;

    writer.flush()?;
    writer.into_inner().map_err(|e| ExportError::Io(e.into_error()))
}
