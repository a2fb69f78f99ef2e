//! SQLite backend
//!
//! Owns a current-thread tokio runtime and a single connection; every call
//! blocks on the sqlx future. `sqlite::memory:` gives a private database per
//! store.

use super::planner::SqlParam;
use super::sql::{decode_row, Dialect, SqlDriver, SqlStatement, SqlStore};
use super::{StorageError, StorageResult};
use crate::interpreter::types::{FieldType, Record, RecordSchema};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Row};
use std::str::FromStr;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{info, warn};

pub struct SqliteDriver {
    runtime: Runtime,
    /// Taken and closed on drop
    conn: Option<SqliteConnection>,
}

impl SqliteDriver {
    fn session(&mut self) -> StorageResult<(&Runtime, &mut SqliteConnection)> {
        let conn = self.conn.as_mut().ok_or(StorageError::Closed)?;
        Ok((&self.runtime, conn))
    }
}

pub type SqliteStore = SqlStore<SqliteDriver>;

impl SqlStore<SqliteDriver> {
    pub fn connect(database_url: &str, timeout: Duration) -> StorageResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let conn = runtime.block_on(async {
            let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
            // An in-memory database lives and dies with this one connection
            tokio::time::timeout(timeout, options.connect())
                .await
                .map_err(|_| StorageError::ConnectTimeout(timeout))?
                .map_err(StorageError::from)
        })?;
        info!(url = %database_url, "Connected to SQLite record store");
        SqlStore::with_driver(SqliteDriver {
            runtime,
            conn: Some(conn),
        })
    }

    pub fn in_memory() -> StorageResult<Self> {
        Self::connect("sqlite::memory:", Duration::from_secs(30))
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[SqlParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param.clone() {
            SqlParam::Null(FieldType::Int) => query.bind(None::<i64>),
            SqlParam::Null(FieldType::Number) => query.bind(None::<f64>),
            SqlParam::Null(FieldType::Bool) => query.bind(None::<bool>),
            SqlParam::Null(_) => query.bind(None::<String>),
            SqlParam::Int(n) => query.bind(n),
            SqlParam::Real(n) => query.bind(n),
            SqlParam::Text(s) => query.bind(s),
            SqlParam::Bool(b) => query.bind(b),
        };
    }
    query
}

impl SqlDriver for SqliteDriver {
    const DIALECT: Dialect = Dialect::Sqlite;
    const KIND: &'static str = "sqlite";

    fn execute(&mut self, stmt: &SqlStatement) -> StorageResult<u64> {
        let query = bind_all(sqlx::query(&stmt.text), &stmt.params);
        let (runtime, conn) = self.session()?;
        let result = runtime.block_on(query.execute(&mut *conn))?;
        Ok(result.rows_affected())
    }

    fn fetch_rows(&mut self, stmt: &SqlStatement, schema: &RecordSchema) -> StorageResult<Vec<Record>> {
        let query = bind_all(sqlx::query(&stmt.text), &stmt.params);
        let (runtime, conn) = self.session()?;
        let rows = runtime.block_on(query.fetch_all(&mut *conn))?;
        rows.iter().map(|row| decode_row(row, schema)).collect()
    }

    fn fetch_id(&mut self, stmt: &SqlStatement) -> StorageResult<i64> {
        let query = bind_all(sqlx::query(&stmt.text), &stmt.params);
        let (runtime, conn) = self.session()?;
        let row = runtime.block_on(query.fetch_one(&mut *conn))?;
        Ok(row.try_get::<i64, _>(0usize)?)
    }

    fn fetch_text(&mut self, stmt: &SqlStatement) -> StorageResult<Option<String>> {
        let query = bind_all(sqlx::query(&stmt.text), &stmt.params);
        let (runtime, conn) = self.session()?;
        let row = runtime.block_on(query.fetch_optional(&mut *conn))?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>(0usize)?)),
            None => Ok(None),
        }
    }
}

impl Drop for SqliteDriver {
    fn drop(&mut self) {
        // Close on the store's own runtime before that runtime shuts down
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.runtime.block_on(conn.close()) {
                warn!("Failed to close SQLite connection: {}", err);
            }
        }
    }
}
