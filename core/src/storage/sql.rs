//! SQL text shared by the SQLite and Postgres backends
//!
//! Statements are built as text plus an ordered parameter list; each backend
//! binds the parameters with its own sqlx driver.

use super::planner::{PredicatePlan, SqlParam, SqlWhere};
use super::{record_id, RecordScope, Storage, StorageError, StorageResult};
use crate::interpreter::types::{CmpOp, FieldType, Record, RecordSchema, Val, ID_FIELD, TENANT_FIELD};
use std::collections::BTreeSet;
use tracing::debug;

pub const STATE_TABLE: &str = "flowgate_app_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", n),
        }
    }

    fn column_type(self, field_type: FieldType) -> &'static str {
        match (self, field_type) {
            (Dialect::Sqlite, FieldType::Text | FieldType::Json) => "TEXT",
            (Dialect::Sqlite, FieldType::Int) => "INTEGER",
            (Dialect::Sqlite, FieldType::Number) => "REAL",
            (Dialect::Sqlite, FieldType::Bool) => "BOOLEAN",
            // Byte-wise ordering to match SQLite's BINARY collation
            (Dialect::Postgres, FieldType::Text) => "TEXT COLLATE \"C\"",
            (Dialect::Postgres, FieldType::Json) => "TEXT",
            (Dialect::Postgres, FieldType::Int) => "BIGINT",
            (Dialect::Postgres, FieldType::Number) => "DOUBLE PRECISION",
            (Dialect::Postgres, FieldType::Bool) => "BOOLEAN",
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }
}

/// Statement text with its parameters in binding order
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub text: String,
    pub params: Vec<SqlParam>,
}

pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Columns read back for a schema, `id` first
pub fn select_columns(schema: &RecordSchema) -> Vec<String> {
    std::iter::once(ID_FIELD.to_string())
        .chain(schema.fields.iter().map(|f| f.name.clone()))
        .collect()
}

pub fn create_table(dialect: Dialect, schema: &RecordSchema) -> String {
    let mut columns = vec![format!("{} {}", quote(ID_FIELD), dialect.id_column())];
    for field in &schema.fields {
        columns.push(format!("{} {}", quote(&field.name), dialect.column_type(field.field_type)));
    }
    if schema.tenant_scoped {
        columns.push(format!("{} TEXT", quote(TENANT_FIELD)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&schema.table_name()),
        columns.join(", ")
    )
}

pub fn create_state_table(dialect: Dialect) -> String {
    let id_type = match dialect {
        Dialect::Sqlite => "INTEGER",
        Dialect::Postgres => "BIGINT",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {} (id {} PRIMARY KEY, payload TEXT NOT NULL)",
        STATE_TABLE, id_type
    )
}

pub fn load_state(dialect: Dialect) -> String {
    format!("SELECT payload FROM {} WHERE id = {}", STATE_TABLE, dialect.placeholder(1))
}

pub fn save_state(dialect: Dialect) -> String {
    format!(
        "INSERT INTO {table} (id, payload) VALUES ({p1}, {p2}) \
         ON CONFLICT (id) DO UPDATE SET payload = excluded.payload",
        table = STATE_TABLE,
        p1 = dialect.placeholder(1),
        p2 = dialect.placeholder(2),
    )
}

/// Encode a normalized value for a typed column
pub fn encode(field_type: FieldType, value: &Val) -> SqlParam {
    match (field_type, value) {
        (_, Val::Null) => SqlParam::Null(field_type),
        (FieldType::Json, v) => SqlParam::Text(serde_json::to_string(v).unwrap_or_else(|_| "null".to_string())),
        (FieldType::Int, Val::Num(n)) => SqlParam::Int(*n as i64),
        (FieldType::Number, Val::Num(n)) => SqlParam::Real(*n),
        (FieldType::Bool, Val::Bool(b)) => SqlParam::Bool(*b),
        (FieldType::Text, Val::Str(s)) => SqlParam::Text(s.clone()),
        // Values are normalized before encoding; anything else is stored as null
        _ => SqlParam::Null(field_type),
    }
}

fn tenant_param(tenant: Val) -> SqlParam {
    match tenant {
        Val::Str(s) => SqlParam::Text(s),
        _ => SqlParam::Null(FieldType::Text),
    }
}

/// `INSERT ... RETURNING id` for a normalized row
pub fn insert(dialect: Dialect, schema: &RecordSchema, row: &Record, scope: &RecordScope) -> SqlStatement {
    let mut columns = Vec::new();
    let mut params = Vec::new();
    for field in &schema.fields {
        columns.push(quote(&field.name));
        params.push(encode(field.field_type, row.get(&field.name).unwrap_or(&Val::Null)));
    }
    if let Some(tenant) = scope.column_value(schema) {
        columns.push(quote(TENANT_FIELD));
        params.push(tenant_param(tenant));
    }
    let table = quote(&schema.table_name());
    let text = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, quote(ID_FIELD))
    } else {
        let placeholders: Vec<String> = (1..=params.len()).map(|n| dialect.placeholder(n)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table,
            columns.join(", "),
            placeholders.join(", "),
            quote(ID_FIELD)
        )
    };
    SqlStatement { text, params }
}

/// `SELECT` for rows in scope matching an optional native WHERE tree, ordered by id
pub fn select(dialect: Dialect, schema: &RecordSchema, filter: Option<&SqlWhere>, scope: &RecordScope) -> SqlStatement {
    let mut params = Vec::new();
    let mut clauses = Vec::new();
    if let Some(filter) = filter {
        clauses.push(render(dialect, filter, &mut params));
    }
    if let Some(tenant) = scope.column_value(schema) {
        clauses.push(scope_clause(dialect, tenant, &mut params));
    }
    let columns: Vec<String> = select_columns(schema).iter().map(|c| quote(c)).collect();
    let mut text = format!("SELECT {} FROM {}", columns.join(", "), quote(&schema.table_name()));
    if !clauses.is_empty() {
        text.push_str(" WHERE ");
        text.push_str(&clauses.join(" AND "));
    }
    text.push_str(&format!(" ORDER BY {} ASC", quote(ID_FIELD)));
    SqlStatement { text, params }
}

/// `UPDATE` of the listed normalized changes on one row
pub fn update_by_id(dialect: Dialect, schema: &RecordSchema, changes: &Record, id: i64) -> SqlStatement {
    let mut params = Vec::new();
    let mut assignments = Vec::new();
    for (field, value) in changes {
        let field_type = schema.field(field).map(|f| f.field_type).unwrap_or(FieldType::Json);
        params.push(encode(field_type, value));
        assignments.push(format!("{} = {}", quote(field), dialect.placeholder(params.len())));
    }
    params.push(SqlParam::Int(id));
    SqlStatement {
        text: format!(
            "UPDATE {} SET {} WHERE {} = {}",
            quote(&schema.table_name()),
            assignments.join(", "),
            quote(ID_FIELD),
            dialect.placeholder(params.len())
        ),
        params,
    }
}

pub fn delete_by_id(dialect: Dialect, schema: &RecordSchema, id: i64) -> SqlStatement {
    SqlStatement {
        text: format!(
            "DELETE FROM {} WHERE {} = {}",
            quote(&schema.table_name()),
            quote(ID_FIELD),
            dialect.placeholder(1)
        ),
        params: vec![SqlParam::Int(id)],
    }
}

fn scope_clause(dialect: Dialect, tenant: Val, params: &mut Vec<SqlParam>) -> String {
    match tenant {
        Val::Str(s) => {
            params.push(SqlParam::Text(s));
            format!("{} = {}", quote(TENANT_FIELD), dialect.placeholder(params.len()))
        }
        _ => format!("{} IS NULL", quote(TENANT_FIELD)),
    }
}

/// Render a WHERE tree, appending its parameters in placeholder order
pub fn render(dialect: Dialect, filter: &SqlWhere, params: &mut Vec<SqlParam>) -> String {
    match filter {
        SqlWhere::True => "1 = 1".to_string(),
        SqlWhere::Cmp { column, op, param } => {
            params.push(param.clone());
            format!("{} {} {}", quote(column), op.sql(), dialect.placeholder(params.len()))
        }
        SqlWhere::IsNull { column, negated } => {
            format!("{} IS {}NULL", quote(column), if *negated { "NOT " } else { "" })
        }
        SqlWhere::Contains { column, needle } => {
            params.push(SqlParam::Text(needle.clone()));
            let func = match dialect {
                Dialect::Sqlite => "instr",
                Dialect::Postgres => "strpos",
            };
            format!("{}({}, {}) > 0", func, quote(column), dialect.placeholder(params.len()))
        }
        SqlWhere::And { items } => join(dialect, items, " AND ", "1 = 1", params),
        SqlWhere::Or { items } => join(dialect, items, " OR ", "1 = 0", params),
        SqlWhere::Not { inner } => format!("NOT ({})", render(dialect, inner, params)),
    }
}

fn join(dialect: Dialect, items: &[SqlWhere], sep: &str, empty: &str, params: &mut Vec<SqlParam>) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = items.iter().map(|item| render(dialect, item, params)).collect();
    format!("({})", parts.join(sep))
}

/* ===================== Shared Store ===================== */

/// Blocking access to one SQL connection
pub trait SqlDriver {
    const DIALECT: Dialect;
    const KIND: &'static str;

    fn execute(&mut self, stmt: &SqlStatement) -> StorageResult<u64>;
    fn fetch_rows(&mut self, stmt: &SqlStatement, schema: &RecordSchema) -> StorageResult<Vec<Record>>;
    fn fetch_id(&mut self, stmt: &SqlStatement) -> StorageResult<i64>;
    fn fetch_text(&mut self, stmt: &SqlStatement) -> StorageResult<Option<String>>;
}

/// Record store over any SQL driver.
///
/// Tables are created on first use. Update and delete select the matching
/// ids first (natively or through the fallback filter) and then touch rows
/// one id at a time in ascending order, so both paths write the same rows.
pub struct SqlStore<D> {
    driver: D,
    tables: BTreeSet<String>,
    depth: usize,
}

impl<D: SqlDriver> SqlStore<D> {
    pub fn with_driver(mut driver: D) -> StorageResult<Self> {
        driver.execute(&raw(create_state_table(D::DIALECT)))?;
        Ok(Self {
            driver,
            tables: BTreeSet::new(),
            depth: 0,
        })
    }

    fn ensure_table(&mut self, schema: &RecordSchema) -> StorageResult<()> {
        let table = schema.table_name();
        if !self.tables.contains(&table) {
            self.driver.execute(&raw(create_table(D::DIALECT, schema)))?;
            self.tables.insert(table);
        }
        Ok(())
    }

    fn select(&mut self, schema: &RecordSchema, plan: &PredicatePlan, scope: &RecordScope) -> StorageResult<Vec<Record>> {
        self.ensure_table(schema)?;
        match &plan.sql {
            Some(filter) => {
                let stmt = select(D::DIALECT, schema, Some(filter), scope);
                debug!(sql = %stmt.text, "pushdown query");
                self.driver.fetch_rows(&stmt, schema)
            }
            None => {
                let stmt = select(D::DIALECT, schema, None, scope);
                let rows = self.driver.fetch_rows(&stmt, schema)?;
                Ok(rows.into_iter().filter(|row| plan.matches(row)).collect())
            }
        }
    }

    fn insert(&mut self, schema: &RecordSchema, mut row: Record, scope: &RecordScope) -> StorageResult<Record> {
        let id = self.driver.fetch_id(&insert(D::DIALECT, schema, &row, scope))?;
        row.insert(ID_FIELD.to_string(), Val::Num(id as f64));
        Ok(row)
    }
}

fn raw(text: String) -> SqlStatement {
    SqlStatement { text, params: Vec::new() }
}

impl<D: SqlDriver> Storage for SqlStore<D> {
    fn kind(&self) -> &'static str {
        D::KIND
    }

    fn begin(&mut self) -> StorageResult<()> {
        if self.depth == 0 {
            self.driver.execute(&raw("BEGIN".to_string()))?;
        }
        self.depth += 1;
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        match self.depth {
            0 => Err(StorageError::NoTransaction("commit")),
            1 => {
                self.driver.execute(&raw("COMMIT".to_string()))?;
                self.depth = 0;
                Ok(())
            }
            _ => {
                self.depth -= 1;
                Ok(())
            }
        }
    }

    fn rollback(&mut self) -> StorageResult<()> {
        if self.depth == 0 {
            return Err(StorageError::NoTransaction("roll back"));
        }
        self.depth = 0;
        // Tables created inside the transaction are gone again
        self.tables.clear();
        self.driver.execute(&raw("ROLLBACK".to_string()))?;
        Ok(())
    }

    fn create(&mut self, schema: &RecordSchema, values: &Record, scope: &RecordScope) -> StorageResult<Record> {
        let row = schema.normalize_record(values)?;
        self.ensure_table(schema)?;
        self.insert(schema, row, scope)
    }

    fn find(&mut self, schema: &RecordSchema, plan: &PredicatePlan, scope: &RecordScope) -> StorageResult<Vec<Record>> {
        self.select(schema, plan, scope)
    }

    fn update(
        &mut self,
        schema: &RecordSchema,
        plan: &PredicatePlan,
        changes: &Record,
        scope: &RecordScope,
    ) -> StorageResult<Vec<Record>> {
        let changes = schema.normalize_changes(changes)?;
        let rows = self.select(schema, plan, scope)?;
        let mut updated = Vec::with_capacity(rows.len());
        for mut row in rows {
            if let (false, Some(id)) = (changes.is_empty(), record_id(&row)) {
                self.driver.execute(&update_by_id(D::DIALECT, schema, &changes, id))?;
            }
            row.extend(changes.clone());
            updated.push(row);
        }
        Ok(updated)
    }

    fn delete(&mut self, schema: &RecordSchema, plan: &PredicatePlan, scope: &RecordScope) -> StorageResult<Vec<Record>> {
        let rows = self.select(schema, plan, scope)?;
        for id in rows.iter().filter_map(record_id) {
            self.driver.execute(&delete_by_id(D::DIALECT, schema, id))?;
        }
        Ok(rows)
    }

    fn save(&mut self, schema: &RecordSchema, values: &Record, scope: &RecordScope) -> StorageResult<Record> {
        let row = schema.normalize_record(values)?;
        self.ensure_table(schema)?;
        let existing = match record_id(values) {
            Some(id) => {
                let by_id = super::plan(schema, &super::Filter::compare(ID_FIELD, CmpOp::Eq, id as f64))?;
                self.select(schema, &by_id, scope)?.first().map(|_| id)
            }
            None => None,
        };
        let Some(id) = existing else {
            return self.insert(schema, row, scope);
        };
        if !row.is_empty() {
            self.driver.execute(&update_by_id(D::DIALECT, schema, &row, id))?;
        }
        let mut saved = row;
        saved.insert(ID_FIELD.to_string(), Val::Num(id as f64));
        Ok(saved)
    }

    fn load_state(&mut self) -> StorageResult<Option<Val>> {
        let stmt = SqlStatement {
            text: load_state(D::DIALECT),
            params: vec![SqlParam::Int(1)],
        };
        match self.driver.fetch_text(&stmt)? {
            Some(text) => Ok(Some(Val::from(serde_json::from_str::<serde_json::Value>(&text)?))),
            None => Ok(None),
        }
    }

    fn save_state(&mut self, state: &Val) -> StorageResult<()> {
        let stmt = SqlStatement {
            text: save_state(D::DIALECT),
            params: vec![SqlParam::Int(1), SqlParam::Text(serde_json::to_string(state)?)],
        };
        self.driver.execute(&stmt)?;
        Ok(())
    }
}

/// Decode a row selected with [`select_columns`] order
pub(crate) fn decode_row<R>(row: &R, schema: &RecordSchema) -> StorageResult<Record>
where
    R: sqlx::Row,
    usize: sqlx::ColumnIndex<R>,
    i64: sqlx::Type<R::Database> + for<'r> sqlx::Decode<'r, R::Database>,
    f64: sqlx::Type<R::Database> + for<'r> sqlx::Decode<'r, R::Database>,
    bool: sqlx::Type<R::Database> + for<'r> sqlx::Decode<'r, R::Database>,
    String: sqlx::Type<R::Database> + for<'r> sqlx::Decode<'r, R::Database>,
{
    let mut record = Record::new();
    let id: i64 = row.try_get(0usize)?;
    record.insert(ID_FIELD.to_string(), Val::Num(id as f64));
    for (offset, field) in schema.fields.iter().enumerate() {
        let index = offset + 1;
        let value = match field.field_type {
            FieldType::Text => row.try_get::<Option<String>, _>(index)?.map(Val::Str),
            FieldType::Int => row.try_get::<Option<i64>, _>(index)?.map(|n| Val::Num(n as f64)),
            FieldType::Number => row.try_get::<Option<f64>, _>(index)?.map(Val::Num),
            FieldType::Bool => row.try_get::<Option<bool>, _>(index)?.map(Val::Bool),
            FieldType::Json => match row.try_get::<Option<String>, _>(index)? {
                Some(text) => Some(Val::from(serde_json::from_str::<serde_json::Value>(&text)?)),
                None => None,
            },
        };
        record.insert(field.name.clone(), value.unwrap_or(Val::Null));
    }
    Ok(record)
}
