//! SQLite-backed persistent storage.
//!
//! [`Store`] wraps the connection pool and is passed explicitly into every
//! component constructor (work queue, source queue, record store, query
//! layer). Nothing in the crate reaches for a global connection.
//!
//! # Usage
//!
//! ```rust,ignore
//! use repo_scout::storage::{RecordStore, Store};
//!
//! let store = Store::open("sqlite://repo_scout.db").await?;
//! let records = RecordStore::new(store.clone());
//! records.store(&batch).await?;
//! ```

pub mod records;
pub mod schema;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};

use crate::error::StorageError;

pub use records::{
    Dependency, EnrichedRecord, LanguageShare, PersistReport, RecordStore, RepositoryRow,
    StoreSummary, StoredRecord,
};

/// Columns and rows returned by an ad-hoc read query.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Shared handle to the relational store.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and provision the schema.
    ///
    /// Accepts either a `sqlite://` URL or a bare file path.
    pub async fn open(url: &str) -> Result<Self, StorageError> {
        Self::open_with(url, 8).await
    }

    pub async fn open_with(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite://{url}")
        };

        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool };
        store.ensure_schema().await?;

        tracing::info!(url = %url, "Store opened");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in schema::all_schema_statements() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Run a read-only statement and return its rows as JSON values.
    ///
    /// Callers are responsible for vetting `sql`; see `query::is_safe_to_execute`.
    pub async fn fetch_rows(&self, sql: &str) -> Result<QueryRows, StorageError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;

        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                values.push(decode_value(row, idx)?);
            }
            out.push(values);
        }

        Ok(QueryRows { columns, rows: out })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_value(row: &sqlx::sqlite::SqliteRow, idx: usize) -> Result<Value, StorageError> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(idx)?),
        "REAL" => Value::from(row.try_get::<f64, _>(idx)?),
        "BLOB" => Value::from(hex::encode(row.try_get::<Vec<u8>, _>(idx)?)),
        _ => Value::from(row.try_get::<String, _>(idx)?),
    };
    Ok(value)
}

/// Current time as epoch milliseconds, the storage timestamp format.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(column: &'static str, millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis).ok_or(StorageError::InvalidValue {
        column,
        value: millis.to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::*;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout.db");
        let path = path.to_str().unwrap();

        let first = Store::open(path).await.unwrap();
        first.close().await;
        let second = Store::open(&format!("sqlite://{path}")).await.unwrap();
        second.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_rows_decodes_types() {
        let (_dir, store) = temp_store().await;
        let rows = store
            .fetch_rows("SELECT 1 AS n, 2.5 AS r, 'x' AS s, NULL AS z")
            .await
            .unwrap();

        assert_eq!(rows.columns, vec!["n", "r", "s", "z"]);
        assert_eq!(
            rows.rows,
            vec![vec![
                Value::from(1),
                Value::from(2.5),
                Value::from("x"),
                Value::Null
            ]]
        );
    }

    #[tokio::test]
    async fn test_fetch_rows_empty_result() {
        let (_dir, store) = temp_store().await;
        let rows = store.fetch_rows("SELECT * FROM repositories").await.unwrap();
        assert!(rows.columns.is_empty());
        assert!(rows.rows.is_empty());
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = Utc::now();
        let back = from_millis("t", to_millis(now)).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
