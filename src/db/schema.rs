//! Database schema definitions
//!
//! Contains SQL for creating all tables and indexes

use rusqlite::Connection;

use super::DbError;

/// SQL schema for all tables
const SCHEMA: &str = r#"
-- One computed value per (family, bucket, metric); overwritten on refresh
CREATE TABLE IF NOT EXISTS metric_snapshots (
    family TEXT NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    period_type TEXT NOT NULL,
    metric_key TEXT NOT NULL,
    value TEXT NOT NULL,
    record_count INTEGER,
    origin TEXT NOT NULL DEFAULT 'observed',
    cached_at TEXT NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (family, period_start, period_end, period_type, metric_key)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_cached ON metric_snapshots(family, cached_at);

-- OAuth credentials, one row per provider
CREATE TABLE IF NOT EXISTS oauth_tokens (
    provider TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Create all database tables
pub fn create_tables(conn: &Connection) -> Result<(), DbError> {
    drop_unbounded_snapshots(conn)?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Snapshot tables from before bucket ends were keyed are dropped; their rows
/// cannot be told apart from truncated buckets and are refetched instead.
fn drop_unbounded_snapshots(conn: &Connection) -> Result<(), DbError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('metric_snapshots')")?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    if !columns.is_empty() && !columns.iter().any(|c| c == "period_end") {
        tracing::info!("Dropping metric_snapshots without period_end; snapshots will be refetched");
        conn.execute_batch("DROP TABLE metric_snapshots;")?;
    }
    Ok(())
}
