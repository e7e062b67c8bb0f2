//! Aggregation orchestrator
//!
//! `AggregationService` is built once at startup with its sources, snapshot
//! store and clock, and shared by every request. A request moves through
//! planning, cache check, fetching, aggregation, backfill and persistence,
//! with the cache decision made separately for each metric family.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{all_fresh, SnapshotStore};
use crate::config::AppConfig;
use crate::db::{Database, DbError};
use crate::metrics::aggregate::{flow_value, StockObservations};
use crate::metrics::{BackfillRamp, BucketValue, MetricRegistry};
use crate::models::{
    DateRange, ExternalRecord, Granularity, MetricDefinition, MetricFamily, MetricKey, MetricKind,
    Period, Snapshot, SnapshotKey,
};
use crate::periods::{plan_periods, resolve_range, RangeError};
use crate::sources::{
    DealPipelineSource, FetchError, FetchWindow, FinancialReportSource, RecordSource,
};

// ============================================================================
// Errors
// ============================================================================

/// Request-level failures
#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Source not configured: {0}")]
    Configuration(String),

    #[error("Authorization expired: {0}")]
    AuthExpired(String),

    #[error("Snapshot cache error: {0}")]
    Cache(#[from] DbError),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<RangeError> for AnalyticsError {
    fn from(e: RangeError) -> Self {
        AnalyticsError::Validation(e.to_string())
    }
}

impl From<FetchError> for AnalyticsError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::AuthExpired(msg) => AnalyticsError::AuthExpired(msg),
            FetchError::Cancelled => AnalyticsError::Cancelled,
            other => AnalyticsError::Configuration(other.to_string()),
        }
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Source of "now" for freshness checks, labels and default ranges
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = match self.now.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Request / result
// ============================================================================

/// Inbound aggregation parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationRequest {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub force_refresh: bool,
    /// Restrict to one family; `None` means every configured family
    pub family: Option<MetricFamily>,
}

/// Values of every metric for one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodValues {
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub values: BTreeMap<MetricKey, Decimal>,
}

/// Per-metric description and range total
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSummary {
    pub key: MetricKey,
    pub label: String,
    pub kind: MetricKind,
    pub family: MetricFamily,
    pub total: Decimal,
}

/// A complete series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationResult {
    pub range: DateRange,
    pub granularity: Granularity,
    pub families: Vec<MetricFamily>,
    pub periods: Vec<PeriodValues>,
    pub metrics: Vec<MetricSummary>,
    /// True when every family was served from fresh snapshots
    pub cached: bool,
    /// Stock bucket values backed by a real observation rather than the ramp
    pub historical_data_points: usize,
    /// Labels of buckets holding zero placeholders after a failed fetch
    pub degraded_periods: Vec<String>,
}

impl AggregationResult {
    /// Range totals keyed by metric
    pub fn period_totals(&self) -> BTreeMap<MetricKey, Decimal> {
        self.metrics
            .iter()
            .map(|m| (m.key.clone(), m.total))
            .collect()
    }

    /// One metric's bucket values in period order
    pub fn series(&self, key: &MetricKey) -> Vec<Decimal> {
        self.periods
            .iter()
            .map(|p| p.values.get(key).copied().unwrap_or(Decimal::ZERO))
            .collect()
    }
}

/// Outcome of one family
struct FamilySeries {
    values: BTreeMap<MetricKey, Vec<BucketValue>>,
    cached: bool,
    historical: usize,
    degraded: BTreeSet<usize>,
}

// ============================================================================
// Service
// ============================================================================

/// Request orchestrator with injected sources, store and clock
pub struct AggregationService {
    registry: MetricRegistry,
    sources: BTreeMap<MetricFamily, Arc<dyn RecordSource>>,
    store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    ramp: BackfillRamp,
}

impl AggregationService {
    pub fn new(
        registry: MetricRegistry,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
        ramp: BackfillRamp,
    ) -> Self {
        Self {
            registry,
            sources: BTreeMap::new(),
            store,
            clock,
            cache_ttl,
            ramp,
        }
    }

    /// Register the source serving its family, replacing any previous one
    pub fn with_source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.sources.insert(source.family(), source);
        self
    }

    /// Build the production service from configuration
    pub fn from_config(config: &AppConfig, db: Arc<Database>) -> Result<Self, AnalyticsError> {
        let mut service = Self::new(
            MetricRegistry::from_config(config),
            db.clone(),
            Arc::new(SystemClock),
            config.cache.ttl().ok_or_else(|| {
                AnalyticsError::Configuration(format!(
                    "cache.ttl_hours is out of range: {}",
                    config.cache.ttl_hours
                ))
            })?,
            BackfillRamp::new(config.backfill.baseline_fraction),
        );

        if let Some(pipeline) = &config.pipeline {
            let source = DealPipelineSource::new(pipeline).map_err(AnalyticsError::from)?;
            service = service.with_source(Arc::new(source));
        }
        if let Some(financial) = &config.financial {
            let source = FinancialReportSource::new(financial, db).map_err(AnalyticsError::from)?;
            service = service.with_source(Arc::new(source));
        }

        info!(
            "Aggregation service ready: {} metrics across {:?}",
            service.registry.len(),
            service.registry.families()
        );
        Ok(service)
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Families a request covers; every one must have a source
    fn requested_families(
        &self,
        requested: Option<MetricFamily>,
    ) -> Result<Vec<MetricFamily>, AnalyticsError> {
        let families = match requested {
            Some(family) => vec![family],
            None => self.registry.families(),
        };

        if families.is_empty() {
            return Err(AnalyticsError::Configuration(
                "no metric sources are configured".to_string(),
            ));
        }

        for family in &families {
            if self.registry.family(*family).is_empty() || !self.sources.contains_key(family) {
                return Err(AnalyticsError::Configuration(format!(
                    "{} source is not configured",
                    family
                )));
            }
        }

        Ok(families)
    }

    /// Build the series for a request
    #[instrument(
        skip_all,
        fields(
            date_from = ?request.date_from,
            date_to = ?request.date_to,
            force_refresh = request.force_refresh,
            family = ?request.family
        )
    )]
    pub async fn aggregate(
        &self,
        request: &AggregationRequest,
        cancel: &CancellationToken,
    ) -> Result<AggregationResult, AnalyticsError> {
        debug!("Planning");
        let now = self.clock.now();
        let today = now.date_naive();
        let range = resolve_range(request.date_from, request.date_to, today)?;
        let families = self.requested_families(request.family)?;
        let periods = plan_periods(&range, today);
        let granularity = periods
            .first()
            .map(|p| p.granularity)
            .unwrap_or(Granularity::Month);

        debug!(
            "Planned {} {} buckets for {}..{}",
            periods.len(),
            granularity,
            range.from,
            range.to
        );

        // Families run concurrently; rate limits are enforced inside sources
        let outcomes = join_all(families.iter().map(|family| {
            self.aggregate_family(*family, &range, &periods, request.force_refresh, now, cancel)
        }))
        .await;

        let mut values: BTreeMap<MetricKey, Vec<BucketValue>> = BTreeMap::new();
        let mut cached = true;
        let mut historical = 0;
        let mut degraded: BTreeSet<usize> = BTreeSet::new();

        for (family, outcome) in families.iter().zip(outcomes) {
            let series = outcome.map_err(|e| {
                match &e {
                    AnalyticsError::Cancelled => info!("Request cancelled during {}", family),
                    _ => error!("Failed: {} family: {}", family, e),
                }
                e
            })?;
            cached &= series.cached;
            historical += series.historical;
            degraded.extend(series.degraded);
            values.extend(series.values);
        }

        let mut result = self.assemble(range, granularity, families, &periods, values, cached);
        result.historical_data_points = historical;
        result.degraded_periods = degraded
            .into_iter()
            .filter_map(|i| periods.get(i).map(|p| p.label.clone()))
            .collect();

        debug!("Serve");
        Ok(result)
    }

    fn assemble(
        &self,
        range: DateRange,
        granularity: Granularity,
        families: Vec<MetricFamily>,
        periods: &[Period],
        values: BTreeMap<MetricKey, Vec<BucketValue>>,
        cached: bool,
    ) -> AggregationResult {
        let metrics: Vec<MetricSummary> = self
            .registry
            .iter()
            .filter(|m| families.contains(&m.family))
            .map(|m| {
                let bucket_values: Vec<Decimal> = values
                    .get(&m.key)
                    .map(|v| v.iter().map(|b| b.value).collect())
                    .unwrap_or_default();
                MetricSummary {
                    key: m.key.clone(),
                    label: m.label.clone(),
                    kind: m.kind,
                    family: m.family,
                    total: m.kind.rollup(&bucket_values),
                }
            })
            .collect();

        let periods = periods
            .iter()
            .enumerate()
            .map(|(i, period)| PeriodValues {
                label: period.label.clone(),
                start: period.start,
                end: period.end,
                values: metrics
                    .iter()
                    .map(|m| {
                        let value = values
                            .get(&m.key)
                            .and_then(|v| v.get(i))
                            .map(|b| b.value)
                            .unwrap_or(Decimal::ZERO);
                        (m.key.clone(), value)
                    })
                    .collect(),
            })
            .collect();

        AggregationResult {
            range,
            granularity,
            families,
            periods,
            metrics,
            cached,
            historical_data_points: 0,
            degraded_periods: Vec::new(),
        }
    }

    async fn aggregate_family(
        &self,
        family: MetricFamily,
        range: &DateRange,
        periods: &[Period],
        force_refresh: bool,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<FamilySeries, AnalyticsError> {
        let metrics = self.registry.family(family);
        let source = self.sources.get(&family).ok_or_else(|| {
            AnalyticsError::Configuration(format!("{} source is not configured", family))
        })?;

        debug!("CacheCheck: {}", family);
        let keys: Vec<SnapshotKey> = metrics
            .iter()
            .flat_map(|m| {
                periods
                    .iter()
                    .map(move |p| SnapshotKey::for_period(family, p, &m.key))
            })
            .collect();
        let stored = self.store.get_many(&keys)?;

        let stored_by_metric: BTreeMap<MetricKey, Vec<Option<Snapshot>>> = metrics
            .iter()
            .zip(stored.chunks(periods.len().max(1)))
            .map(|(m, chunk)| (m.key.clone(), chunk.to_vec()))
            .collect();

        if !force_refresh && all_fresh(&stored, now, self.cache_ttl) {
            info!("Serving {} from cache", family);
            return Ok(Self::from_cache(&metrics, stored_by_metric));
        }

        debug!("Fetching: {} (force_refresh={})", family, force_refresh);
        let mut degraded = BTreeSet::new();

        let stock: Vec<&MetricDefinition> =
            metrics.iter().copied().filter(|m| m.is_stock()).collect();
        let flow: Vec<&MetricDefinition> =
            metrics.iter().copied().filter(|m| !m.is_stock()).collect();

        let live_records = if stock.is_empty() {
            Some(Vec::new())
        } else {
            let window = FetchWindow::live(range, now);
            match source.fetch_batch(&stock, &window, cancel).await {
                Ok(records) => Some(records),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!("{} live fetch failed: {}", family, e);
                    None
                }
            }
        };

        let period_records = self
            .fetch_flow_periods(source.as_ref(), &flow, periods, now, cancel)
            .await?;

        debug!("Aggregating: {}", family);
        let mut values: BTreeMap<MetricKey, Vec<BucketValue>> = BTreeMap::new();

        for metric in &flow {
            let series = periods
                .iter()
                .zip(&period_records)
                .enumerate()
                .map(|(i, (period, records))| match records {
                    Some(records) => flow_value(period, &metric.key, records),
                    None => {
                        degraded.insert(i);
                        BucketValue::placeholder()
                    }
                })
                .collect();
            values.insert(metric.key.clone(), series);
        }

        debug!("Backfilling: {}", family);
        let mut historical = 0;
        for metric in &stock {
            let stored = stored_by_metric
                .get(&metric.key)
                .cloned()
                .unwrap_or_default();

            let series: Vec<BucketValue> = match &live_records {
                Some(records) => {
                    let mut observations = StockObservations::from_records(&metric.key, records);
                    if observations.is_empty() {
                        observations.observe(now, Decimal::ZERO, 0);
                    }
                    let live = observations
                        .latest()
                        .map(|(_, v)| v)
                        .unwrap_or(Decimal::ZERO);
                    let observed: Vec<Option<BucketValue>> = periods
                        .iter()
                        .map(|p| observations.value_at_end_of(p))
                        .collect();
                    self.ramp.fill(live, &observed, &stored)
                }
                None => periods
                    .iter()
                    .enumerate()
                    .map(|(i, _)| match stored.get(i).and_then(Option::as_ref) {
                        Some(snapshot) => BucketValue::from_snapshot(snapshot),
                        None => {
                            degraded.insert(i);
                            BucketValue::placeholder()
                        }
                    })
                    .collect(),
            };

            historical += series.iter().filter(|b| b.is_observed()).count();
            values.insert(metric.key.clone(), series);
        }

        debug!("Persisting: {}", family);
        self.persist(family, periods, &values, now);

        if !degraded.is_empty() {
            warn!(
                "{} served with {} degraded buckets",
                family,
                degraded.len()
            );
        }

        Ok(FamilySeries {
            values,
            cached: false,
            historical,
            degraded,
        })
    }

    /// Fetch flow records per bucket; `None` marks a failed bucket
    async fn fetch_flow_periods(
        &self,
        source: &dyn RecordSource,
        flow: &[&MetricDefinition],
        periods: &[Period],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Vec<ExternalRecord>>>, AnalyticsError> {
        if flow.is_empty() {
            return Ok(periods.iter().map(|_| Some(Vec::new())).collect());
        }

        let results: Vec<Result<Vec<ExternalRecord>, FetchError>> = if source.is_rate_limited() {
            let mut results = Vec::with_capacity(periods.len());
            for period in periods {
                let window = FetchWindow::for_period(period, now);
                let result = source.fetch_batch(flow, &window, cancel).await;
                let fatal = matches!(&result, Err(e) if e.is_fatal());
                results.push(result);
                if fatal {
                    break;
                }
            }
            results
        } else {
            join_all(periods.iter().map(|period| async move {
                let window = FetchWindow::for_period(period, now);
                source.fetch_batch(flow, &window, cancel).await
            }))
            .await
        };

        let mut records = Vec::with_capacity(periods.len());
        for (period, result) in periods.iter().zip(results) {
            match result {
                Ok(fetched) => records.push(Some(fetched)),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        "{} fetch failed for {}: {}",
                        source.family(),
                        period.label,
                        e
                    );
                    records.push(None);
                }
            }
        }
        Ok(records)
    }

    fn from_cache(
        metrics: &[&MetricDefinition],
        stored: BTreeMap<MetricKey, Vec<Option<Snapshot>>>,
    ) -> FamilySeries {
        let mut values = BTreeMap::new();
        let mut historical = 0;

        for metric in metrics {
            let series: Vec<BucketValue> = stored
                .get(&metric.key)
                .map(|snapshots| {
                    snapshots
                        .iter()
                        .map(|s| match s {
                            Some(snapshot) => BucketValue::from_snapshot(snapshot),
                            None => BucketValue::placeholder(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            if metric.is_stock() {
                historical += series.iter().filter(|b| b.is_observed()).count();
            }
            values.insert(metric.key.clone(), series);
        }

        FamilySeries {
            values,
            cached: true,
            historical,
            degraded: BTreeSet::new(),
        }
    }

    /// Store every non-placeholder value; failures are logged, not surfaced
    fn persist(
        &self,
        family: MetricFamily,
        periods: &[Period],
        values: &BTreeMap<MetricKey, Vec<BucketValue>>,
        now: DateTime<Utc>,
    ) {
        let entries: Vec<(SnapshotKey, Snapshot)> = values
            .iter()
            .flat_map(|(metric, series)| {
                periods.iter().zip(series).filter_map(move |(period, value)| {
                    value.snapshot_origin().map(|origin| {
                        (
                            SnapshotKey::for_period(family, period, metric),
                            Snapshot {
                                value: value.value,
                                count: value.count,
                                origin,
                                cached_at: now,
                            },
                        )
                    })
                })
            })
            .collect();

        match self.store.put_many(&entries) {
            Ok(()) => debug!("Persisted {} {} snapshots", entries.len(), family),
            Err(e) => error!("Failed to persist {} snapshots: {}", family, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySnapshotStore;
    use crate::models::Selector;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Flow source returning one record per bucket, dated on the bucket start
    struct PerBucketSource {
        amount: Decimal,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecordSource for PerBucketSource {
        fn family(&self) -> MetricFamily {
            MetricFamily::Financial
        }

        async fn fetch_batch(
            &self,
            metrics: &[&MetricDefinition],
            window: &FetchWindow,
            _cancel: &CancellationToken,
        ) -> Result<Vec<ExternalRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let at = window.start.and_hms_opt(9, 0, 0).unwrap().and_utc();
            Ok(metrics
                .iter()
                .map(|m| ExternalRecord::new(m.key.clone(), self.amount, at))
                .collect())
        }
    }

    fn revenue_registry() -> MetricRegistry {
        MetricRegistry::new(vec![MetricDefinition {
            key: MetricKey::from("revenue"),
            label: "Revenue".to_string(),
            kind: MetricKind::Flow,
            family: MetricFamily::Financial,
            selector: Selector::ReportCategory,
        }])
    }

    fn service(source: Arc<PerBucketSource>) -> AggregationService {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 20, 12, 0, 0).unwrap());
        AggregationService::new(
            revenue_registry(),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(clock),
            Duration::hours(24),
            BackfillRamp::default(),
        )
        .with_source(source)
    }

    #[tokio::test]
    async fn test_flow_series_and_total() {
        let source = Arc::new(PerBucketSource {
            amount: Decimal::from(100),
            calls: AtomicUsize::new(0),
        });
        let service = service(source.clone());
        let request = AggregationRequest {
            date_from: NaiveDate::from_ymd_opt(2025, 6, 1),
            date_to: NaiveDate::from_ymd_opt(2025, 6, 20),
            ..Default::default()
        };

        let result = service
            .aggregate(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.granularity, Granularity::Week);
        assert_eq!(result.periods.len(), 3);
        assert_eq!(
            result.period_totals()[&MetricKey::from("revenue")],
            Decimal::from(300)
        );
        assert!(!result.cached);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unconfigured_family_is_configuration_error() {
        let source = Arc::new(PerBucketSource {
            amount: Decimal::ONE,
            calls: AtomicUsize::new(0),
        });
        let service = service(source);
        let request = AggregationRequest {
            family: Some(MetricFamily::Pipeline),
            ..Default::default()
        };

        let result = service.aggregate(&request, &CancellationToken::new()).await;
        assert!(matches!(result, Err(AnalyticsError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected_before_fetching() {
        let source = Arc::new(PerBucketSource {
            amount: Decimal::ONE,
            calls: AtomicUsize::new(0),
        });
        let service = service(source.clone());
        let request = AggregationRequest {
            date_from: NaiveDate::from_ymd_opt(2025, 6, 20),
            date_to: NaiveDate::from_ymd_opt(2025, 6, 1),
            ..Default::default()
        };

        let result = service.aggregate(&request, &CancellationToken::new()).await;
        assert!(matches!(result, Err(AnalyticsError::Validation(_))));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 6, 20, 12, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        clock.advance(Duration::hours(25));
        assert_eq!(clock.now(), start + Duration::hours(25));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2025, 6, 21).unwrap());
    }

    #[test]
    fn test_fetch_errors_map_to_request_errors() {
        assert!(matches!(
            AnalyticsError::from(FetchError::AuthExpired("x".into())),
            AnalyticsError::AuthExpired(_)
        ));
        assert!(matches!(
            AnalyticsError::from(FetchError::NotConfigured("x".into())),
            AnalyticsError::Configuration(_)
        ));
        assert!(matches!(
            AnalyticsError::from(FetchError::Cancelled),
            AnalyticsError::Cancelled
        ));
    }
}
