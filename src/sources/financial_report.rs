//! Accounting profit and loss source
//!
//! One report call per bucket covers every financial metric: the report is
//! flattened and classified through the configured account rules. Calls are
//! OAuth authenticated and spaced by a `RateGate` because the provider's quota
//! is per credential.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::account_mapping::{AccountMapper, ReportLine};
use super::oauth::{TokenManager, TokenStore};
use super::rate_gate::RateGate;
use super::{or_cancel, status_error, FetchError, FetchWindow, RecordSource};
use crate::config::FinancialConfig;
use crate::models::{ExternalRecord, MetricDefinition, MetricFamily};

/// Provider name used as the token store key
pub const TOKEN_PROVIDER: &str = "accounting";

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReportsEnvelope {
    #[serde(default)]
    reports: Vec<Report>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Report {
    #[serde(default)]
    rows: Vec<ReportRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReportRow {
    #[serde(default)]
    row_type: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    cells: Vec<ReportCell>,
    #[serde(default)]
    rows: Vec<ReportRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReportCell {
    #[serde(default)]
    value: String,
}

/// Parse a report amount such as `"1,234.50"` or `"(200.00)"`
fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    match cleaned.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => inner.parse::<Decimal>().ok().map(|d| -d),
        None => cleaned.parse().ok(),
    }
}

fn flatten_rows(rows: &[ReportRow], section: &str, out: &mut Vec<ReportLine>) {
    for row in rows {
        match row.row_type.as_str() {
            "Section" => {
                let title = row.title.as_deref().unwrap_or(section);
                flatten_rows(&row.rows, title, out);
            }
            "Row" | "SummaryRow" => {
                let account = row.cells.first().map(|c| c.value.trim()).unwrap_or("");
                let amount = row.cells.get(1).and_then(|c| parse_amount(&c.value));
                match amount {
                    Some(amount) if !account.is_empty() => out.push(ReportLine {
                        section: section.to_string(),
                        account: account.to_string(),
                        amount,
                        is_total: row.row_type == "SummaryRow",
                    }),
                    _ => tracing::debug!("Skipping report row without amount: {:?}", account),
                }
            }
            _ => {}
        }
    }
}

fn flatten_report(envelope: &ReportsEnvelope) -> Result<Vec<ReportLine>, FetchError> {
    let report = envelope
        .reports
        .first()
        .ok_or_else(|| FetchError::Decode("response contains no report".to_string()))?;
    let mut lines = Vec::new();
    flatten_rows(&report.rows, "", &mut lines);
    Ok(lines)
}

// ============================================================================
// Source
// ============================================================================

/// Profit and loss report source
pub struct FinancialReportSource {
    client: reqwest::Client,
    base_url: String,
    tenant_id: String,
    tokens: TokenManager,
    gate: RateGate,
    mapper: AccountMapper,
}

impl FinancialReportSource {
    pub fn new(config: &FinancialConfig, store: Arc<dyn TokenStore>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let refresh_margin = config.refresh_margin().ok_or_else(|| {
            FetchError::NotConfigured(format!(
                "refresh margin out of range: {}s",
                config.refresh_margin_secs
            ))
        })?;

        let tokens = TokenManager::new(
            client.clone(),
            TOKEN_PROVIDER,
            config.token_url.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
            refresh_margin,
            store,
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tenant_id: config.tenant_id.clone(),
            tokens,
            gate: RateGate::new(Duration::from_millis(config.min_call_interval_ms)),
            mapper: AccountMapper::new(&config.account_rules),
        })
    }

    async fn request_report(
        &self,
        access_token: &str,
        window: &FetchWindow,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, FetchError> {
        self.gate.acquire(cancel).await?;

        let url = format!("{}/Reports/ProfitAndLoss", self.base_url);
        let from = window.start.format("%Y-%m-%d").to_string();
        let to = window.end.format("%Y-%m-%d").to_string();

        tracing::debug!("Requesting profit and loss report {} to {}", from, to);

        let request = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .header("xero-tenant-id", &self.tenant_id)
            .header("Accept", "application/json")
            .query(&[("fromDate", from.as_str()), ("toDate", to.as_str())])
            .send();

        or_cancel(async { request.await.map_err(FetchError::from) }, cancel).await
    }

    /// Fetch and flatten the report for a window, retrying once after a 401
    async fn fetch_report(
        &self,
        window: &FetchWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReportLine>, FetchError> {
        if self.tenant_id.is_empty() {
            return Err(FetchError::NotConfigured(
                "financial tenant id is not set".to_string(),
            ));
        }

        let access_token = self.tokens.access_token(cancel).await?;
        let mut response = self.request_report(&access_token, window, cancel).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!("Report request rejected with 401, refreshing token");
            let access_token = self.tokens.force_refresh(&access_token, cancel).await?;
            response = self.request_report(&access_token, window, cancel).await?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(FetchError::AuthExpired(
                    "report request rejected after token refresh".to_string(),
                ));
            }
        }

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let envelope = or_cancel(
            async { response.json::<ReportsEnvelope>().await.map_err(FetchError::from) },
            cancel,
        )
        .await?;
        flatten_report(&envelope)
    }
}

#[async_trait]
impl RecordSource for FinancialReportSource {
    fn family(&self) -> MetricFamily {
        MetricFamily::Financial
    }

    fn is_rate_limited(&self) -> bool {
        true
    }

    async fn fetch_batch(
        &self,
        metrics: &[&MetricDefinition],
        window: &FetchWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExternalRecord>, FetchError> {
        let lines = self.fetch_report(window, cancel).await?;
        let at = window.start.and_time(chrono::NaiveTime::MIN).and_utc();

        let records: Vec<ExternalRecord> = self
            .mapper
            .classify(&lines, at)
            .into_iter()
            .filter(|r| metrics.iter().any(|m| m.key == r.category))
            .collect();

        tracing::debug!(
            "Classified {} report lines into {} records for {}..{}",
            lines.len(),
            records.len(),
            window.start,
            window.end
        );
        Ok(records)
    }
}
