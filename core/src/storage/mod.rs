//! Record storage
//!
//! The engine talks to records only through the [`Storage`] trait. Every
//! backend must return the same rows in the same order (ascending `id`) for
//! the same schema, plan, scope and data.

pub mod memory;
pub mod planner;
pub mod postgres;
pub mod sql;
pub mod sqlite;


use crate::config::{StorageBackend, StorageConfig};
use crate::interpreter::types::{Record, RecordSchema, SchemaError, Val, TENANT_FIELD};
use std::time::Duration;

pub use memory::MemoryStore;
pub use planner::{plan, split_path, Filter, PredicatePlan, SqlParam, SqlWhere};
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("{message}")]
    Pushdown {
        reason_code: &'static str,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to start storage runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Stored value is not valid JSON: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("No open transaction to {0}")]
    NoTransaction(&'static str),

    #[error("Timed out after {0:?} connecting to the database")]
    ConnectTimeout(Duration),

    #[error("Store connection is closed")]
    Closed,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Partition applied to every read and write of a tenant-scoped record type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordScope {
    pub tenant: Option<String>,
}

impl RecordScope {
    pub fn tenant(tenant: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant.into()),
        }
    }

    /// Derive the scope from the run identity's `tenant` attribute
    pub fn from_identity(identity: &Val) -> Self {
        let tenant = identity
            .as_obj()
            .and_then(|obj| obj.get("tenant"))
            .and_then(|t| match t {
                Val::Str(s) => Some(s.clone()),
                Val::Num(n) => Some(n.to_string()),
                _ => None,
            });
        Self { tenant }
    }

    /// Tenant value to stamp on and filter by, `None` when the schema is unscoped
    pub fn column_value(&self, schema: &RecordSchema) -> Option<Val> {
        if !schema.tenant_scoped {
            return None;
        }
        Some(self.tenant.clone().map(Val::Str).unwrap_or(Val::Null))
    }

    pub fn admits(&self, schema: &RecordSchema, row: &Record) -> bool {
        match self.column_value(schema) {
            None => true,
            Some(expected) => row.get(TENANT_FIELD).unwrap_or(&Val::Null) == &expected,
        }
    }
}

/// Uniform record contract implemented by every backend.
///
/// Writes take raw values; backends normalize them against the schema so all
/// of them persist the same canonical form.
pub trait Storage {
    fn kind(&self) -> &'static str;

    fn begin(&mut self) -> StorageResult<()>;
    fn commit(&mut self) -> StorageResult<()>;
    fn rollback(&mut self) -> StorageResult<()>;

    fn create(&mut self, schema: &RecordSchema, values: &Record, scope: &RecordScope) -> StorageResult<Record>;

    fn find(&mut self, schema: &RecordSchema, plan: &PredicatePlan, scope: &RecordScope) -> StorageResult<Vec<Record>>;

    /// Apply `changes` to every matching row; returns the updated rows
    fn update(
        &mut self,
        schema: &RecordSchema,
        plan: &PredicatePlan,
        changes: &Record,
        scope: &RecordScope,
    ) -> StorageResult<Vec<Record>>;

    /// Remove every matching row; returns the removed rows
    fn delete(&mut self, schema: &RecordSchema, plan: &PredicatePlan, scope: &RecordScope) -> StorageResult<Vec<Record>>;

    /// Replace the row named by `values.id` if it exists in scope, else insert
    fn save(&mut self, schema: &RecordSchema, values: &Record, scope: &RecordScope) -> StorageResult<Record>;

    fn load_state(&mut self) -> StorageResult<Option<Val>>;
    fn save_state(&mut self, state: &Val) -> StorageResult<()>;
}

/// Open the backend named by the storage configuration
pub fn open(config: &StorageConfig) -> StorageResult<Box<dyn Storage>> {
    let timeout = Duration::from_secs(config.connect_timeout_secs);
    Ok(match config.backend {
        StorageBackend::Memory => Box::new(MemoryStore::new()),
        StorageBackend::Sqlite => Box::new(SqliteStore::connect(&config.database_url, timeout)?),
        StorageBackend::Postgres => Box::new(PostgresStore::connect(&config.database_url, timeout)?),
    })
}

/// Remove hidden columns before a row leaves the storage layer
pub(crate) fn strip_hidden(mut row: Record) -> Record {
    row.remove(TENANT_FIELD);
    row
}

/// Id carried by a record passed to `save`, if it is a positive integer
pub(crate) fn record_id(values: &Record) -> Option<i64> {
    match values.get(crate::interpreter::types::ID_FIELD) {
        Some(Val::Num(n)) if n.fract() == 0.0 && *n >= 1.0 => Some(*n as i64),
        _ => None,
    }
}
