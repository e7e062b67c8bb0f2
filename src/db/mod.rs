//! Database module for SQLite operations
//!
//! This module handles all database interactions including:
//! - Schema creation
//! - Metric snapshot reads and upserts
//! - OAuth token persistence

pub mod queries;
pub mod schema;

use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;

use crate::sources::oauth::{OAuthToken, TokenStore};

/// Database errors
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file
    pub fn new(path: PathBuf) -> Result<Self, DbError> {
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize the database schema
    pub fn initialize(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        schema::create_tables(&conn)?;
        Ok(())
    }

    /// Execute a query with the database connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        f(&conn)
    }
}

impl TokenStore for Database {
    fn load(&self, provider: &str) -> Result<Option<OAuthToken>, DbError> {
        self.with_connection(|conn| queries::load_token(conn, provider))
    }

    fn save(&self, provider: &str, token: &OAuthToken) -> Result<(), DbError> {
        self.with_connection(|conn| queries::save_token(conn, provider, token))
    }
}

/// Get the default database path
pub fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("siteline").join("analytics.db")
}
