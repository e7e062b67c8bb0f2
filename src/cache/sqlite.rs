//! Snapshot store on the SQLite database

use super::SnapshotStore;
use crate::db::{queries, Database, DbError};
use crate::models::{Snapshot, SnapshotKey};

impl SnapshotStore for Database {
    fn get(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, DbError> {
        self.with_connection(|conn| queries::get_snapshot(conn, key))
    }

    fn put(&self, key: &SnapshotKey, snapshot: &Snapshot) -> Result<(), DbError> {
        self.with_connection(|conn| queries::upsert_snapshot(conn, key, snapshot))
    }

    fn get_many(&self, keys: &[SnapshotKey]) -> Result<Vec<Option<Snapshot>>, DbError> {
        self.with_connection(|conn| {
            keys.iter()
                .map(|key| queries::get_snapshot(conn, key))
                .collect()
        })
    }

    fn put_many(&self, entries: &[(SnapshotKey, Snapshot)]) -> Result<(), DbError> {
        self.with_connection(|conn| queries::upsert_snapshots(conn, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Granularity, MetricFamily, MetricKey, SnapshotOrigin};
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;

    #[test]
    fn test_database_store_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("snapshots.db")).unwrap();
        db.initialize().unwrap();

        let key = SnapshotKey {
            family: MetricFamily::Financial,
            period_start: NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2025, 5, 31).unwrap(),
            granularity: Granularity::Month,
            metric: MetricKey::from("materials"),
        };
        let snapshot = Snapshot {
            value: "8123.45".parse::<Decimal>().unwrap(),
            count: Some(12),
            origin: SnapshotOrigin::Observed,
            cached_at: Utc.with_ymd_and_hms(2025, 6, 20, 8, 0, 0).unwrap(),
        };

        db.put_many(&[(key.clone(), snapshot.clone())]).unwrap();
        assert_eq!(db.get(&key).unwrap(), Some(snapshot.clone()));
        assert_eq!(db.get_many(&[key]).unwrap(), vec![Some(snapshot)]);
    }
}
