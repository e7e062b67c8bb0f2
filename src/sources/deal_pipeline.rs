//! CRM deal pipeline source
//!
//! Uses the deal search endpoint with a stage filter. Stage metrics are
//! fetched as the live value of the stage; dated metrics add a close-date
//! range and return one record per closed deal.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{or_cancel, status_error, FetchError, FetchWindow, RecordSource};
use crate::config::PipelineConfig;
use crate::models::{ExternalRecord, MetricDefinition, MetricFamily, Selector};

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    filter_groups: Vec<FilterGroup>,
    properties: Vec<&'static str>,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<String>,
}

#[derive(Debug, Serialize)]
struct FilterGroup {
    filters: Vec<Filter>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Filter {
    property_name: &'static str,
    operator: &'static str,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    high_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Deal>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Deal {
    #[serde(default)]
    id: String,
    #[serde(default)]
    properties: DealProperties,
}

#[derive(Debug, Default, Deserialize)]
struct DealProperties {
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    closedate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    after: String,
}

/// Parse a close date given as RFC 3339 or epoch milliseconds
fn parse_close_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn parse_deal_amount(deal: &Deal) -> Decimal {
    match deal.properties.amount.as_deref().map(str::trim) {
        None | Some("") => Decimal::ZERO,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::debug!("Deal {} has unparsable amount {:?}", deal.id, raw);
            Decimal::ZERO
        }),
    }
}

// ============================================================================
// Source
// ============================================================================

/// Deal search source
pub struct DealPipelineSource {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    page_limit: u32,
    max_pages: u32,
}

impl DealPipelineSource {
    pub fn new(config: &PipelineConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            page_limit: config.page_limit,
            max_pages: config.max_pages,
        })
    }

    fn filters(stage_id: &str, closed_within: Option<&FetchWindow>) -> Vec<Filter> {
        let mut filters = vec![Filter {
            property_name: "dealstage",
            operator: "EQ",
            value: stage_id.to_string(),
            high_value: None,
        }];

        if let Some(window) = closed_within {
            let low = window.start.and_time(NaiveTime::MIN).and_utc();
            let high = window
                .end
                .and_hms_milli_opt(23, 59, 59, 999)
                .map(|t| t.and_utc())
                .unwrap_or(low);
            filters.push(Filter {
                property_name: "closedate",
                operator: "BETWEEN",
                value: low.timestamp_millis().to_string(),
                high_value: Some(high.timestamp_millis().to_string()),
            });
        }

        filters
    }

    /// Run a search to completion, following paging up to `max_pages`
    async fn search(
        &self,
        stage_id: &str,
        closed_within: Option<&FetchWindow>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Deal>, FetchError> {
        let url = format!("{}/crm/v3/objects/deals/search", self.base_url);
        let mut deals = Vec::new();
        let mut after: Option<String> = None;

        for page in 0..self.max_pages {
            let body = SearchRequest {
                filter_groups: vec![FilterGroup {
                    filters: Self::filters(stage_id, closed_within),
                }],
                properties: vec!["amount", "closedate", "dealstage"],
                limit: self.page_limit,
                after: after.take(),
            };

            let request = self
                .client
                .post(&url)
                .bearer_auth(&self.access_token)
                .json(&body)
                .send();
            let response =
                or_cancel(async { request.await.map_err(FetchError::from) }, cancel).await?;

            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            let page_body = or_cancel(
                async { response.json::<SearchResponse>().await.map_err(FetchError::from) },
                cancel,
            )
            .await?;

            deals.extend(page_body.results);

            match page_body.paging.and_then(|p| p.next) {
                Some(next) => after = Some(next.after),
                None => return Ok(deals),
            }

            if page + 1 == self.max_pages {
                tracing::warn!(
                    "Deal search for stage {} truncated after {} pages",
                    stage_id,
                    self.max_pages
                );
            }
        }

        Ok(deals)
    }

    async fn fetch_metric(
        &self,
        metric: &MetricDefinition,
        window: &FetchWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExternalRecord>, FetchError> {
        let Selector::DealStage { stage_id, dated } = &metric.selector else {
            return Ok(Vec::new());
        };

        if *dated {
            let deals = self.search(stage_id, Some(window), cancel).await?;
            Ok(deals
                .iter()
                .filter_map(|deal| {
                    let closed = deal.properties.closedate.as_deref().and_then(parse_close_date);
                    if closed.is_none() {
                        tracing::debug!("Deal {} has no usable close date", deal.id);
                    }
                    closed.map(|at| {
                        ExternalRecord::new(metric.key.clone(), parse_deal_amount(deal), at)
                    })
                })
                .collect())
        } else {
            let deals = self.search(stage_id, None, cancel).await?;
            Ok(deals
                .iter()
                .map(|deal| {
                    ExternalRecord::new(metric.key.clone(), parse_deal_amount(deal), window.as_of)
                })
                .collect())
        }
    }
}

#[async_trait]
impl RecordSource for DealPipelineSource {
    fn family(&self) -> MetricFamily {
        MetricFamily::Pipeline
    }

    async fn fetch_batch(
        &self,
        metrics: &[&MetricDefinition],
        window: &FetchWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExternalRecord>, FetchError> {
        if self.access_token.is_empty() {
            return Err(FetchError::NotConfigured(
                "pipeline access token is not set".to_string(),
            ));
        }

        let results = join_all(
            metrics
                .iter()
                .map(|metric| self.fetch_metric(metric, window, cancel)),
        )
        .await;

        let mut records = Vec::new();
        for (metric, result) in metrics.iter().zip(results) {
            let fetched = result?;
            tracing::debug!(
                "Fetched {} deal records for {} ({}..{})",
                fetched.len(),
                metric.key,
                window.start,
                window.end
            );
            records.extend(fetched);
        }
        Ok(records)
    }
}
