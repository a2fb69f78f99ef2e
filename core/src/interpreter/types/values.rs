//! Runtime value types

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Runtime value type
///
/// Objects use an ordered map so that serialized values (and therefore trace
/// events and stored JSON) are byte-identical between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Val {
    #[default]
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Val>),
    Obj(BTreeMap<String, Val>),
    /// Handle to an async task launched in the current run
    Task { task_id: String },
}

impl Val {
    pub fn obj() -> Self {
        Val::Obj(BTreeMap::new())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Val::Str(s.into())
    }

    /// Check if value is truthy (for conditionals)
    pub fn is_truthy(&self) -> bool {
        match self {
            Val::Bool(b) => *b,
            Val::Null => false,
            _ => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    /// Scalars are the only values a predicate may compare against
    pub fn is_scalar(&self) -> bool {
        matches!(self, Val::Null | Val::Bool(_) | Val::Num(_) | Val::Str(_))
    }

    /// Human-readable kind name used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Bool(_) => "boolean",
            Val::Num(_) => "number",
            Val::Str(_) => "text",
            Val::List(_) => "list",
            Val::Obj(_) => "object",
            Val::Task { .. } => "task",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Val::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<&BTreeMap<String, Val>> {
        match self {
            Val::Obj(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a dotted path inside nested objects. Missing keys yield `None`.
    pub fn get_path(&self, path: &[String]) -> Option<&Val> {
        let mut current = self;
        for segment in path {
            current = current.as_obj()?.get(segment)?;
        }
        Some(current)
    }

    /// Ordering between two scalars of the same kind.
    ///
    /// Text compares byte-wise, matching SQLite's BINARY collation and the
    /// `"C"` collation used on Postgres.
    pub fn partial_cmp_scalar(&self, other: &Val) -> Option<Ordering> {
        match (self, other) {
            (Val::Num(a), Val::Num(b)) => a.partial_cmp(b),
            (Val::Str(a), Val::Str(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Val::Bool(a), Val::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Numbers print without a trailing `.0` when integral
pub fn format_num(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Text rendering used for string concatenation and log messages
impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => write!(f, "null"),
            Val::Bool(b) => write!(f, "{}", b),
            Val::Num(n) => write!(f, "{}", format_num(*n)),
            Val::Str(s) => write!(f, "{}", s),
            Val::Task { task_id } => write!(f, "<task {}>", task_id),
            other => {
                let json = serde_json::to_string(other).map_err(|_| fmt::Error)?;
                write!(f, "{}", json)
            }
        }
    }
}

impl From<serde_json::Value> for Val {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Val::Null,
            serde_json::Value::Bool(b) => Val::Bool(b),
            serde_json::Value::Number(n) => Val::Num(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Val::Str(s),
            serde_json::Value::Array(items) => Val::List(items.into_iter().map(Val::from).collect()),
            serde_json::Value::Object(map) => {
                Val::Obj(map.into_iter().map(|(k, v)| (k, Val::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Self {
        Val::Bool(b)
    }
}

impl From<f64> for Val {
    fn from(n: f64) -> Self {
        Val::Num(n)
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Self {
        Val::Str(s.to_string())
    }
}

impl From<String> for Val {
    fn from(s: String) -> Self {
        Val::Str(s)
    }
}
