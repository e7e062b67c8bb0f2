//! Wire tests for the CRM deal search source

use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use siteline_lib::config::PipelineConfig;
use siteline_lib::models::{MetricDefinition, MetricFamily, MetricKey, MetricKind, Selector};
use siteline_lib::sources::{DealPipelineSource, FetchError, FetchWindow, RecordSource};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SEARCH_PATH: &str = "/crm/v3/objects/deals/search";

fn config(server: &MockServer, token: &str) -> PipelineConfig {
    PipelineConfig {
        base_url: server.uri(),
        access_token: token.to_string(),
        page_limit: 2,
        max_pages: 5,
        ..PipelineConfig::default()
    }
}

fn stage_metric() -> MetricDefinition {
    MetricDefinition {
        key: MetricKey::from("advanced-negotiations"),
        label: "Advanced Negotiations".to_string(),
        kind: MetricKind::Stock,
        family: MetricFamily::Pipeline,
        selector: Selector::DealStage {
            stage_id: "contractsent".to_string(),
            dated: false,
        },
    }
}

fn closed_won_metric() -> MetricDefinition {
    MetricDefinition {
        key: MetricKey::from("closed-won"),
        label: "Closed Won".to_string(),
        kind: MetricKind::Flow,
        family: MetricFamily::Pipeline,
        selector: Selector::DealStage {
            stage_id: "closedwon".to_string(),
            dated: true,
        },
    }
}

fn june_window() -> FetchWindow {
    FetchWindow {
        start: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        end: NaiveDate::from_ymd_opt(2025, 6, 7).unwrap(),
        as_of: Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_stage_search_follows_paging() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(body_partial_json(json!({ "after": "2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "id": "3", "properties": { "amount": "300" } }
            ]
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(header("authorization", "Bearer crm-token"))
        .and(body_partial_json(json!({
            "limit": 2,
            "filterGroups": [{
                "filters": [{ "propertyName": "dealstage", "operator": "EQ", "value": "contractsent" }]
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "id": "1", "properties": { "amount": "100" } },
                { "id": "2", "properties": { "amount": "200.50" } }
            ],
            "paging": { "next": { "after": "2" } }
        })))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let source = DealPipelineSource::new(&config(&server, "crm-token")).unwrap();
    let metric = stage_metric();
    let window = june_window();

    let records = source
        .fetch_batch(&[&metric], &window, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.timestamp == window.as_of));
    assert!(records.iter().all(|r| r.category == metric.key));
    let total: Decimal = records.iter().map(|r| r.amount).sum();
    assert_eq!(total, "600.50".parse::<Decimal>().unwrap());
}

#[tokio::test]
async fn test_closed_won_search_is_close_date_ranged() {
    let server = MockServer::start().await;
    let low = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    let high = Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap() - chrono::Duration::milliseconds(1);

    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(body_partial_json(json!({
            "filterGroups": [{
                "filters": [
                    { "propertyName": "dealstage", "operator": "EQ", "value": "closedwon" },
                    {
                        "propertyName": "closedate",
                        "operator": "BETWEEN",
                        "value": low.timestamp_millis().to_string(),
                        "highValue": high.timestamp_millis().to_string()
                    }
                ]
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "id": "10", "properties": { "amount": "5000", "closedate": "2025-06-03T14:00:00Z" } },
                { "id": "11", "properties": { "amount": "750", "closedate": null } },
                { "id": "12", "properties": { "amount": "", "closedate": "2025-06-05T09:30:00.000Z" } }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = DealPipelineSource::new(&config(&server, "crm-token")).unwrap();
    let metric = closed_won_metric();

    let records = source
        .fetch_records(&metric, &june_window(), &CancellationToken::new())
        .await
        .unwrap();

    // Deal 11 has no close date and is dropped; deal 12 has no amount
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].amount, Decimal::from(5000));
    assert_eq!(
        records[0].timestamp,
        Utc.with_ymd_and_hms(2025, 6, 3, 14, 0, 0).unwrap()
    );
    assert_eq!(records[1].amount, Decimal::ZERO);
}

#[tokio::test]
async fn test_missing_token_is_not_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let source = DealPipelineSource::new(&config(&server, "")).unwrap();
    let metric = stage_metric();
    let result = source
        .fetch_batch(&[&metric], &june_window(), &CancellationToken::new())
        .await;

    match result {
        Err(e @ FetchError::NotConfigured(_)) => assert!(e.is_fatal()),
        other => panic!("expected NotConfigured, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_is_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let source = DealPipelineSource::new(&config(&server, "crm-token")).unwrap();
    let metric = stage_metric();
    let result = source
        .fetch_batch(&[&metric], &june_window(), &CancellationToken::new())
        .await;

    match result {
        Err(e @ FetchError::Status { status: 502, .. }) => {
            assert!(!e.is_fatal());
            assert!(e.to_string().contains("upstream unavailable"));
        }
        other => panic!("expected HTTP 502, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancelled_search_returns_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "results": [] }))
                .set_delay(std::time::Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let source = DealPipelineSource::new(&config(&server, "crm-token")).unwrap();
    let metric = stage_metric();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = source.fetch_batch(&[&metric], &june_window(), &cancel).await;
    assert!(matches!(result, Err(FetchError::Cancelled)));
}
