//! Snapshot cache
//!
//! Stores one computed value per (family, bucket, metric). Freshness is
//! judged at read time against a ttl; rows never expire on their own and are
//! overwritten wholesale on refresh.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Duration, Utc};

use crate::db::DbError;
use crate::models::{Snapshot, SnapshotKey};

pub use memory::MemorySnapshotStore;

/// Concurrent snapshot storage with last-writer-wins writes
pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, DbError>;

    fn put(&self, key: &SnapshotKey, snapshot: &Snapshot) -> Result<(), DbError>;

    /// Read several keys, preserving order
    fn get_many(&self, keys: &[SnapshotKey]) -> Result<Vec<Option<Snapshot>>, DbError> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    fn put_many(&self, entries: &[(SnapshotKey, Snapshot)]) -> Result<(), DbError> {
        for (key, snapshot) in entries {
            self.put(key, snapshot)?;
        }
        Ok(())
    }
}

/// True when every key has a snapshot younger than `ttl`.
///
/// An empty set is never fresh.
pub fn all_fresh(snapshots: &[Option<Snapshot>], now: DateTime<Utc>, ttl: Duration) -> bool {
    !snapshots.is_empty()
        && snapshots
            .iter()
            .all(|s| s.as_ref().is_some_and(|s| s.is_fresh(now, ttl)))
}
