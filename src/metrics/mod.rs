//! Metric registry and aggregation
//!
//! - `registry`: which metrics exist, their stock/flow kind and source
//! - `aggregate`: per-bucket values from fetched records
//! - `backfill`: deterministic history for stock buckets without observations

pub mod aggregate;
pub mod backfill;
pub mod registry;

pub use aggregate::{BucketValue, ValueOrigin};
pub use backfill::BackfillRamp;
pub use registry::MetricRegistry;
