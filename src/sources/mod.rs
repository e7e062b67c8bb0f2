//! External record sources
//!
//! Each metric family is served by one `RecordSource`:
//! - `deal_pipeline`: CRM deal search, stage filtered and close-date ranged
//! - `financial_report`: accounting profit and loss report, OAuth protected
//!   and rate limited per credential
//!
//! Sources translate a fetch window into their native query and map the
//! response into `ExternalRecord`s tagged with the metric key they feed.

pub mod account_mapping;
pub mod deal_pipeline;
pub mod financial_report;
pub mod oauth;
pub mod rate_gate;

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{DateRange, ExternalRecord, MetricDefinition, MetricFamily, Period};

pub use deal_pipeline::DealPipelineSource;
pub use financial_report::FinancialReportSource;
pub use oauth::{OAuthToken, TokenStore};
pub use rate_gate::RateGate;

/// Errors from a single external call
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Authorization expired: {0}")]
    AuthExpired(String),

    #[error("Source not configured: {0}")]
    NotConfigured(String),

    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Fatal errors fail the whole request instead of degrading one bucket
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::AuthExpired(_) | FetchError::NotConfigured(_) | FetchError::Cancelled
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

/// Interval a fetch covers.
///
/// `start` and `end` are inclusive dates. `as_of` stamps point-in-time
/// records such as the live value of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub as_of: DateTime<Utc>,
}

impl FetchWindow {
    /// Window of one bucket; `as_of` is the bucket end, or now for the open bucket
    pub fn for_period(period: &Period, now: DateTime<Utc>) -> Self {
        Self {
            start: period.start,
            end: period.end,
            as_of: period.end_exclusive().min(now),
        }
    }

    /// Window for a live observation over a whole range
    pub fn live(range: &DateRange, now: DateTime<Utc>) -> Self {
        Self {
            start: range.from,
            end: range.to,
            as_of: now,
        }
    }
}

/// Capability interface over one external system
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Family of metrics this source serves
    fn family(&self) -> MetricFamily;

    /// Sources with a per-credential quota must be called sequentially
    fn is_rate_limited(&self) -> bool {
        false
    }

    /// Fetch records for several metrics of this family in one pass.
    ///
    /// Stock metrics yield records stamped with `window.as_of`; flow metrics
    /// yield records dated inside the window.
    async fn fetch_batch(
        &self,
        metrics: &[&MetricDefinition],
        window: &FetchWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExternalRecord>, FetchError>;

    /// Fetch records for a single metric
    async fn fetch_records(
        &self,
        metric: &MetricDefinition,
        window: &FetchWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExternalRecord>, FetchError> {
        let records = self.fetch_batch(&[metric], window, cancel).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.category == metric.key)
            .collect())
    }
}

/// Race a fetch against cancellation
pub async fn or_cancel<F, T>(fut: F, cancel: &CancellationToken) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        res = fut => res,
    }
}

/// Read an error response body for diagnostics, truncated
pub(crate) async fn status_error(response: reqwest::Response) -> FetchError {
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > 512 {
        let mut cut = 512;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    FetchError::Status { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Granularity;
    use chrono::TimeZone;

    #[test]
    fn test_fatal_errors() {
        assert!(FetchError::AuthExpired("refresh rejected".into()).is_fatal());
        assert!(FetchError::NotConfigured("no token".into()).is_fatal());
        assert!(FetchError::Cancelled.is_fatal());
        assert!(!FetchError::Network("reset".into()).is_fatal());
        assert!(!FetchError::Status {
            status: 500,
            body: String::new()
        }
        .is_fatal());
    }

    #[test]
    fn test_window_for_open_period_is_stamped_now() {
        let period = Period {
            start: NaiveDate::from_ymd_opt(2025, 10, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 10, 19).unwrap(),
            granularity: Granularity::Month,
            label: "Oct 19".to_string(),
        };
        let now = Utc.with_ymd_and_hms(2025, 10, 19, 15, 30, 0).unwrap();
        assert_eq!(FetchWindow::for_period(&period, now).as_of, now);

        let later = Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap();
        assert_eq!(
            FetchWindow::for_period(&period, later).as_of,
            period.end_exclusive()
        );
    }

    #[tokio::test]
    async fn test_or_cancel_returns_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), FetchError> =
            or_cancel(std::future::pending(), &token).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_or_cancel_passes_result_through() {
        let token = CancellationToken::new();
        let result = or_cancel(async { Ok::<_, FetchError>(7) }, &token).await;
        assert_eq!(result.unwrap(), 7);
    }
}
