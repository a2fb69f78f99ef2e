//! Postgres backend
//!
//! Same shape as the SQLite backend: a private current-thread runtime and
//! one connection held for the lifetime of the store, so `BEGIN`/`COMMIT`
//! always land on the session that issued the writes.

use super::planner::SqlParam;
use super::sql::{decode_row, Dialect, SqlDriver, SqlStatement, SqlStore};
use super::{StorageError, StorageResult};
use crate::interpreter::types::{FieldType, Record, RecordSchema};
use sqlx::postgres::{PgArguments, PgConnection, Postgres};
use sqlx::query::Query;
use sqlx::{Connection, Row};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{info, warn};

pub struct PgDriver {
    runtime: Runtime,
    /// Taken and closed on drop
    conn: Option<PgConnection>,
}

impl PgDriver {
    fn session(&mut self) -> StorageResult<(&Runtime, &mut PgConnection)> {
        let conn = self.conn.as_mut().ok_or(StorageError::Closed)?;
        Ok((&self.runtime, conn))
    }
}

pub type PostgresStore = SqlStore<PgDriver>;

impl SqlStore<PgDriver> {
    pub fn connect(database_url: &str, timeout: Duration) -> StorageResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let conn = runtime.block_on(async {
            tokio::time::timeout(timeout, PgConnection::connect(database_url))
                .await
                .map_err(|_| StorageError::ConnectTimeout(timeout))?
                .map_err(StorageError::from)
        })?;
        info!("Connected to Postgres record store");
        SqlStore::with_driver(PgDriver {
            runtime,
            conn: Some(conn),
        })
    }
}

fn bind_all<'q>(mut query: Query<'q, Postgres, PgArguments>, params: &[SqlParam]) -> Query<'q, Postgres, PgArguments> {
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

impl SqlDriver for PgDriver {
    const DIALECT: Dialect = Dialect::Postgres;
    const KIND: &'static str = "postgres";

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

impl Drop for PgDriver {
    fn drop(&mut self) {
        // Close on the store's own runtime before that runtime shuts down
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.runtime.block_on(conn.close()) {
                warn!("Failed to close Postgres connection: {}", err);
            }
        }
    }
}
