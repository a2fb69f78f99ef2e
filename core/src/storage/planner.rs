//! Predicate planner
//!
//! Compiles a value-bound [`Filter`] into a [`PredicatePlan`]. Scalar
//! comparisons over top-level typed fields become a backend-neutral
//! [`SqlWhere`] tree; anything touching a json field or a nested path keeps
//! `sql = None`, records why, and relies on the in-memory filter. Both paths
//! use SQL three-valued logic so they select the same rows.

use super::{StorageError, StorageResult};
use crate::interpreter::errors;
use crate::interpreter::types::{CmpOp, FieldType, Record, RecordSchema, Val, ID_FIELD};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/* ===================== Filters ===================== */

/// Predicate with every operand already evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Filter {
    All,
    Compare {
        path: Vec<String>,
        op: CmpOp,
        value: Val,
    },
    Contains {
        path: Vec<String>,
        value: Val,
    },
    And {
        items: Vec<Filter>,
    },
    Or {
        items: Vec<Filter>,
    },
    Not {
        inner: Box<Filter>,
    },
}

impl Filter {
    pub fn compare(field: &str, op: CmpOp, value: impl Into<Val>) -> Self {
        Filter::Compare {
            path: split_path(field),
            op,
            value: value.into(),
        }
    }

    pub fn contains(field: &str, value: impl Into<Val>) -> Self {
        Filter::Contains {
            path: split_path(field),
            value: value.into(),
        }
    }

    /// Kleene evaluation: `None` is SQL's UNKNOWN
    pub fn eval(&self, row: &Record) -> Option<bool> {
        match self {
            Filter::All => Some(true),
            Filter::Compare { path, op, value } => {
                let lhs = lookup(row, path);
                compare(lhs, *op, value)
            }
            Filter::Contains { path, value } => match (lookup(row, path), value) {
                (Val::Null, _) | (_, Val::Null) => None,
                (Val::Str(haystack), Val::Str(needle)) => Some(haystack.contains(needle.as_str())),
                (Val::List(items), needle) => Some(items.contains(needle)),
                _ => Some(false),
            },
            Filter::And { items } => {
                let mut result = Some(true);
                for item in items {
                    match item.eval(row) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Filter::Or { items } => {
                let mut result = Some(false);
                for item in items {
                    match item.eval(row) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Filter::Not { inner } => inner.eval(row).map(|b| !b),
        }
    }

    pub fn matches(&self, row: &Record) -> bool {
        self.eval(row) == Some(true)
    }
}

pub fn split_path(field: &str) -> Vec<String> {
    field.split('.').map(str::to_string).collect()
}

fn lookup<'a>(row: &'a Record, path: &[String]) -> &'a Val {
    let Some((head, rest)) = path.split_first() else {
        return &Val::Null;
    };
    row.get(head)
        .and_then(|v| v.get_path(rest))
        .unwrap_or(&Val::Null)
}

fn compare(lhs: &Val, op: CmpOp, rhs: &Val) -> Option<bool> {
    if rhs.is_null() {
        // `= null` / `<> null` are planned as IS NULL / IS NOT NULL
        return match op {
            CmpOp::Eq => Some(lhs.is_null()),
            CmpOp::Ne => Some(!lhs.is_null()),
            _ => None,
        };
    }
    if lhs.is_null() {
        return None;
    }
    let Some(ordering) = lhs.partial_cmp_scalar(rhs) else {
        return match op {
            CmpOp::Eq => Some(false),
            CmpOp::Ne => Some(true),
            _ => None,
        };
    };
    Some(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

/* ===================== Plans ===================== */

/// Bound parameter for a native query fragment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v")]
pub enum SqlParam {
    Null(FieldType),
    Int(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

/// Backend-neutral WHERE tree; rendered per dialect in `storage::sql`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t")]
pub enum SqlWhere {
    True,
    Cmp {
        column: String,
        op: CmpOp,
        param: SqlParam,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    Contains {
        column: String,
        needle: String,
    },
    And {
        items: Vec<SqlWhere>,
    },
    Or {
        items: Vec<SqlWhere>,
    },
    Not {
        inner: Box<SqlWhere>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredicatePlan {
    pub sql: Option<SqlWhere>,
    pub sql_reason: Option<String>,
    #[serde(skip)]
    pub filter: Filter,
}

impl PredicatePlan {
    pub fn all() -> Self {
        Self {
            sql: Some(SqlWhere::True),
            sql_reason: None,
            filter: Filter::All,
        }
    }

    pub fn is_pushdown(&self) -> bool {
        self.sql.is_some()
    }

    pub fn matches(&self, row: &Record) -> bool {
        self.filter.matches(row)
    }
}

enum Lowered {
    Native(SqlWhere),
    Fallback(String),
}

/// Compile a filter against a schema.
///
/// Errors are raised only for predicates neither path can honor: unknown
/// fields, non-scalar comparison values and type-incompatible comparisons
/// on typed columns.
pub fn plan(schema: &RecordSchema, filter: &Filter) -> StorageResult<PredicatePlan> {
    let lowered = lower(schema, filter)?;
    Ok(match lowered {
        Lowered::Native(sql) => PredicatePlan {
            sql: Some(sql),
            sql_reason: None,
            filter: filter.clone(),
        },
        Lowered::Fallback(reason) => PredicatePlan {
            sql: None,
            sql_reason: Some(reason),
            filter: filter.clone(),
        },
    })
}

fn lower(schema: &RecordSchema, filter: &Filter) -> StorageResult<Lowered> {
    match filter {
        Filter::All => Ok(Lowered::Native(SqlWhere::True)),
        Filter::Compare { path, op, value } => lower_compare(schema, path, *op, value),
        Filter::Contains { path, value } => lower_contains(schema, path, value),
        Filter::And { items } => lower_all(schema, items, |items| SqlWhere::And { items }),
        Filter::Or { items } => lower_all(schema, items, |items| SqlWhere::Or { items }),
        Filter::Not { inner } => Ok(match lower(schema, inner)? {
            Lowered::Native(sql) => Lowered::Native(SqlWhere::Not { inner: Box::new(sql) }),
            fallback => fallback,
        }),
    }
}

fn lower_all(
    schema: &RecordSchema,
    items: &[Filter],
    combine: impl FnOnce(Vec<SqlWhere>) -> SqlWhere,
) -> StorageResult<Lowered> {
    let mut native = Vec::with_capacity(items.len());
    let mut reason = None;
    // Keep lowering after a fallback so every operand is still validated
    for item in items {
        match lower(schema, item)? {
            Lowered::Native(sql) => native.push(sql),
            Lowered::Fallback(r) => {
                reason.get_or_insert(r);
            }
        }
    }
    Ok(match reason {
        Some(r) => Lowered::Fallback(r),
        None => Lowered::Native(combine(native)),
    })
}

/// Resolve the leading path segment to a column type; `id` is an int
fn column_type(schema: &RecordSchema, path: &[String]) -> StorageResult<FieldType> {
    let head = path.first().map(String::as_str).unwrap_or_default();
    if head == ID_FIELD {
        return Ok(FieldType::Int);
    }
    schema
        .field(head)
        .map(|f| f.field_type)
        .ok_or_else(|| StorageError::Pushdown {
            reason_code: errors::UNKNOWN_FIELD,
            message: format!("Unknown field '{}' in predicate on record '{}'", head, schema.name),
        })
}

fn lower_compare(schema: &RecordSchema, path: &[String], op: CmpOp, value: &Val) -> StorageResult<Lowered> {
    let field_type = column_type(schema, path)?;
    let dotted = path.join(".");
    if !value.is_scalar() {
        return Err(StorageError::Pushdown {
            reason_code: errors::NON_SCALAR_COMPARISON,
            message: format!("Cannot compare field '{}' against a {} value", dotted, value.kind()),
        });
    }
    if field_type == FieldType::Json {
        return Ok(Lowered::Fallback(format!(
            "field '{}' is a json field and is filtered in memory",
            dotted
        )));
    }
    if path.len() > 1 {
        return Err(incompatible(&dotted, field_type, "a nested path"));
    }
    let column = path[0].clone();
    if value.is_null() {
        return match op {
            CmpOp::Eq => Ok(Lowered::Native(SqlWhere::IsNull { column, negated: false })),
            CmpOp::Ne => Ok(Lowered::Native(SqlWhere::IsNull { column, negated: true })),
            _ => Err(incompatible(&dotted, field_type, "null in an ordering comparison")),
        };
    }
    let param = match (field_type, value) {
        (FieldType::Text, Val::Str(s)) => SqlParam::Text(s.clone()),
        (FieldType::Int, Val::Num(n)) if n.fract() == 0.0 => SqlParam::Int(*n as i64),
        (FieldType::Int | FieldType::Number, Val::Num(n)) => SqlParam::Real(*n),
        (FieldType::Bool, Val::Bool(b)) => SqlParam::Bool(*b),
        _ => return Err(incompatible(&dotted, field_type, value.kind())),
    };
    Ok(Lowered::Native(SqlWhere::Cmp { column, op, param }))
}

fn lower_contains(schema: &RecordSchema, path: &[String], value: &Val) -> StorageResult<Lowered> {
    let field_type = column_type(schema, path)?;
    let dotted = path.join(".");
    if !value.is_scalar() {
        return Err(StorageError::Pushdown {
            reason_code: errors::NON_SCALAR_COMPARISON,
            message: format!("Cannot test field '{}' for a {} value", dotted, value.kind()),
        });
    }
    if field_type == FieldType::Json {
        return Ok(Lowered::Fallback(format!(
            "contains on json field '{}' is filtered in memory",
            dotted
        )));
    }
    match (field_type, value) {
        (FieldType::Text, Val::Str(needle)) if path.len() == 1 => Ok(Lowered::Native(SqlWhere::Contains {
            column: path[0].clone(),
            needle: needle.clone(),
        })),
        _ => Err(incompatible(&dotted, field_type, value.kind())),
    }
}

fn incompatible(field: &str, field_type: FieldType, got: &str) -> StorageError {
    StorageError::Pushdown {
        reason_code: errors::INCOMPATIBLE_COMPARISON,
        message: format!("Field '{}' of type {} cannot be compared with {}", field, field_type.as_str(), got),
    }
}
