//! Data models for the analytics aggregator
//!
//! Contains the domain types shared by the period planner, the sources,
//! the snapshot cache and the aggregation service.

pub mod metric;
pub mod period;
pub mod record;
pub mod snapshot;

pub use metric::{MetricDefinition, MetricFamily, MetricKey, MetricKind, Selector};
pub use period::{DateRange, Granularity, Period};
pub use record::ExternalRecord;
pub use snapshot::{Snapshot, SnapshotKey, SnapshotOrigin};
