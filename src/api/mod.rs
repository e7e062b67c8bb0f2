//! HTTP surface
//!
//! Routes:
//! - `GET /api/analytics` returns the aggregated series for a date range
//! - `GET /api/analytics/export` returns the same series as CSV or JSON
//! - `GET /health` is a liveness probe
//!
//! Each request owns a `CancellationToken` guarded by a drop guard, so work
//! still in flight stops when the client goes away or the timeout fires.

pub mod dto;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::export::{self, ExportError, ExportFormat};
use crate::models::MetricFamily;
use crate::periods::dates::parse_date;
use crate::service::{AggregationRequest, AggregationResult, AggregationService, AnalyticsError};
use dto::{AnalyticsQuery, AnalyticsResponse, ErrorResponse, ExportQuery, HealthResponse};

/// Status written when the caller abandoned the request
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<AggregationService>,
    pub request_timeout: Duration,
}

impl ApiState {
    pub fn new(service: Arc<AggregationService>, request_timeout: Duration) -> Self {
        Self {
            service,
            request_timeout,
        }
    }
}

/// Errors surfaced by handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),

    #[error("Request timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Export(#[from] ExportError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Analytics(e) => match e {
                AnalyticsError::Validation(_) => StatusCode::BAD_REQUEST,
                AnalyticsError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
                AnalyticsError::AuthExpired(_) => StatusCode::BAD_GATEWAY,
                AnalyticsError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
                AnalyticsError::Cancelled => StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::BAD_REQUEST),
            },
            ApiError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Export(ExportError::InvalidFormat(_)) => StatusCode::BAD_REQUEST,
            ApiError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Analytics(AnalyticsError::Cancelled) => info!("Request cancelled"),
            _ if status.is_server_error() => error!(status = %status, "{}", self),
            _ => debug!(status = %status, "{}", self),
        }

        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

/// Build the application router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/analytics", get(get_analytics))
        .route("/api/analytics/export", get(export_analytics))
        .with_state(state)
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /api/analytics
#[instrument(skip(state))]
async fn get_analytics(
    State(state): State<ApiState>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<AnalyticsResponse>, ApiError> {
    let request = parse_request(&query)?;
    let result = run_aggregation(&state, &request).await?;
    Ok(Json(AnalyticsResponse::from_result(&result, &request)))
}

/// GET /api/analytics/export
#[instrument(skip(state))]
async fn export_analytics(
    State(state): State<ApiState>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let format = match query.format.as_deref().map(str::trim) {
        None | Some("") => ExportFormat::default(),
        Some(raw) => raw.parse::<ExportFormat>()?,
    };
    let request = parse_request(&query.analytics())?;
    let result = run_aggregation(&state, &request).await?;
    let document = export::render(&result, format)?;

    let disposition = format!("attachment; filename=\"{}\"", document.filename);
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        document.body,
    )
        .into_response())
}

/// Run one aggregation under the request timeout.
///
/// The drop guard cancels the token whenever this future ends early, so a
/// disconnecting client and an elapsed timeout both stop in-flight fetches.
async fn run_aggregation(
    state: &ApiState,
    request: &AggregationRequest,
) -> Result<AggregationResult, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match tokio::time::timeout(
        state.request_timeout,
        state.service.aggregate(request, &cancel),
    )
    .await
    {
        Ok(result) => Ok(result?),
        Err(_) => {
            cancel.cancel();
            Err(ApiError::TimedOut(state.request_timeout))
        }
    }
}

fn parse_optional_date(
    name: &str,
    raw: Option<&str>,
) -> Result<Option<chrono::NaiveDate>, AnalyticsError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => parse_date(value).map(Some).ok_or_else(|| {
            AnalyticsError::Validation(format!("{} must be YYYY-MM-DD, got {:?}", name, value))
        }),
    }
}

fn parse_refresh(raw: Option<&str>) -> Result<bool, AnalyticsError> {
    match raw.map(|v| v.trim().to_lowercase()).as_deref() {
        None | Some("") | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(AnalyticsError::Validation(format!(
            "refresh must be true or false, got {:?}",
            other
        ))),
    }
}

/// Translate query parameters into a service request
pub fn parse_request(query: &AnalyticsQuery) -> Result<AggregationRequest, AnalyticsError> {
    let family = match query.family.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<MetricFamily>()
                .map_err(AnalyticsError::Validation)?,
        ),
    };

    Ok(AggregationRequest {
        date_from: parse_optional_date("date_from", query.date_from.as_deref())?,
        date_to: parse_optional_date("date_to", query.date_to.as_deref())?,
        force_refresh: parse_refresh(query.refresh.as_deref())?,
        family,
    })
}
