//! In-process snapshot store

use std::collections::HashMap;
use std::sync::RwLock;

use super::SnapshotStore;
use crate::db::DbError;
use crate::models::{Snapshot, SnapshotKey};

/// Snapshot store backed by a map; contents are lost on restart
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<SnapshotKey, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, DbError> {
        let snapshots = self.snapshots.read().map_err(|_| DbError::LockPoisoned)?;
        Ok(snapshots.get(key).cloned())
    }

    fn put(&self, key: &SnapshotKey, snapshot: &Snapshot) -> Result<(), DbError> {
        let mut snapshots = self.snapshots.write().map_err(|_| DbError::LockPoisoned)?;
        snapshots.insert(key.clone(), snapshot.clone());
        Ok(())
    }

    fn get_many(&self, keys: &[SnapshotKey]) -> Result<Vec<Option<Snapshot>>, DbError> {
        let snapshots = self.snapshots.read().map_err(|_| DbError::LockPoisoned)?;
        Ok(keys.iter().map(|key| snapshots.get(key).cloned()).collect())
    }

    fn put_many(&self, entries: &[(SnapshotKey, Snapshot)]) -> Result<(), DbError> {
        let mut snapshots = self.snapshots.write().map_err(|_| DbError::LockPoisoned)?;
        for (key, snapshot) in entries {
            snapshots.insert(key.clone(), snapshot.clone());
        }
        Ok(())
    }
}
