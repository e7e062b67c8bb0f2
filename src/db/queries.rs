//! Database query implementations
//!
//! Contains functions for reading and writing snapshots and OAuth tokens

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;

use super::DbError;
use crate::models::{Snapshot, SnapshotKey, SnapshotOrigin};
use crate::sources::oauth::OAuthToken;

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("timestamp {:?}: {}", raw, e)))
}

/// Raw snapshot columns before parsing
struct SnapshotRow {
    value: String,
    record_count: Option<i64>,
    origin: String,
    cached_at: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot, DbError> {
        let value = self
            .value
            .parse::<Decimal>()
            .map_err(|e| DbError::Corrupt(format!("value {:?}: {}", self.value, e)))?;
        let origin = self.origin.parse::<SnapshotOrigin>().map_err(DbError::Corrupt)?;

        Ok(Snapshot {
            value,
            count: self.record_count.map(|c| c.clamp(0, u32::MAX as i64) as u32),
            origin,
            cached_at: parse_timestamp(&self.cached_at)?,
        })
    }
}

/// Get one snapshot
pub fn get_snapshot(conn: &Connection, key: &SnapshotKey) -> Result<Option<Snapshot>, DbError> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT value, record_count, origin, cached_at
        FROM metric_snapshots
        WHERE family = ?1 AND period_start = ?2 AND period_end = ?3
          AND period_type = ?4 AND metric_key = ?5
        "#,
    )?;

    let row = stmt
        .query_row(
            params![
                key.family.as_str(),
                key.period_start.format("%Y-%m-%d").to_string(),
                key.period_end.format("%Y-%m-%d").to_string(),
                key.granularity.as_str(),
                key.metric.as_str()
            ],
            |row| {
                Ok(SnapshotRow {
                    value: row.get(0)?,
                    record_count: row.get(1)?,
                    origin: row.get(2)?,
                    cached_at: row.get(3)?,
                })
            },
        )
        .optional()?;

    row.map(SnapshotRow::into_snapshot).transpose()
}

/// Insert or overwrite a snapshot (last writer wins)
pub fn upsert_snapshot(
    conn: &Connection,
    key: &SnapshotKey,
    snapshot: &Snapshot,
) -> Result<(), DbError> {
    conn.prepare_cached(
        r#"
        INSERT INTO metric_snapshots (
            family, period_start, period_end, period_type, metric_key,
            value, record_count, origin, cached_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)
        ON CONFLICT(family, period_start, period_end, period_type, metric_key) DO UPDATE SET
            value = excluded.value,
            record_count = excluded.record_count,
            origin = excluded.origin,
            cached_at = excluded.cached_at,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )?
    .execute(params![
        key.family.as_str(),
        key.period_start.format("%Y-%m-%d").to_string(),
        key.period_end.format("%Y-%m-%d").to_string(),
        key.granularity.as_str(),
        key.metric.as_str(),
        snapshot.value.to_string(),
        snapshot.count.map(i64::from),
        snapshot.origin.as_str(),
        snapshot.cached_at.to_rfc3339(),
    ])?;

    Ok(())
}

/// Write several snapshots in one transaction
pub fn upsert_snapshots(
    conn: &Connection,
    entries: &[(SnapshotKey, Snapshot)],
) -> Result<(), DbError> {
    let tx = conn.unchecked_transaction()?;
    for (key, snapshot) in entries {
        upsert_snapshot(&tx, key, snapshot)?;
    }
    tx.commit()?;
    Ok(())
}

/// Count snapshots stored for a family
pub fn count_snapshots(conn: &Connection, family: &str) -> Result<u32, DbError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM metric_snapshots WHERE family = ?1",
        params![family],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

/// Load a provider's OAuth token
pub fn load_token(conn: &Connection, provider: &str) -> Result<Option<OAuthToken>, DbError> {
    let row = conn
        .query_row(
            "SELECT access_token, refresh_token, expires_at FROM oauth_tokens WHERE provider = ?1",
            params![provider],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(access_token, refresh_token, expires_at)| {
        Ok(OAuthToken {
            access_token,
            refresh_token,
            expires_at: parse_timestamp(&expires_at)?,
        })
    })
    .transpose()
}

/// Replace a provider's OAuth token in one transaction
pub fn save_token(conn: &Connection, provider: &str, token: &OAuthToken) -> Result<(), DbError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        r#"
        INSERT INTO oauth_tokens (provider, access_token, refresh_token, expires_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
        ON CONFLICT(provider) DO UPDATE SET
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            expires_at = excluded.expires_at,
            updated_at = CURRENT_TIMESTAMP
        "#,
        params![
            provider,
            token.access_token,
            token.refresh_token,
            token.expires_at.to_rfc3339()
        ],
    )?;
    tx.commit()?;
    Ok(())
}
