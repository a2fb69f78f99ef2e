//! Record schema types
//!
//! A schema describes the shape of one record type. Schemas are part of the
//! lowered program and are never mutated during a run; the planner and every
//! storage backend read them to validate, normalize and encode values.

use super::values::Val;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the implicit primary key
pub const ID_FIELD: &str = "id";

/// Hidden column that partitions tenant-scoped records
pub const TENANT_FIELD: &str = "_tenant";

/// A stored record: field name to value, always including `id` once persisted
pub type Record = BTreeMap<String, Val>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Int,
    Number,
    Bool,
    /// Semi-structured value stored opaquely; never pushed down to SQL
    Json,
}

impl FieldType {
    pub fn is_scalar(self) -> bool {
        !matches!(self, FieldType::Json)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Int => "int",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
            FieldType::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<FieldDef>,
    /// Records are partitioned by the identity's tenant
    #[serde(default)]
    pub tenant_scoped: bool,
}

/// Problems found while validating a schema or normalizing a value against it
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("Field name '{0}' is not a valid identifier")]
    InvalidFieldName(String),

    #[error("Field '{field}' is declared more than once in record '{record}'")]
    DuplicateField { record: String, field: String },

    #[error("Unknown field '{field}' for record '{record}'")]
    UnknownField { record: String, field: String },

    #[error("Field '{field}' of record '{record}' expects {expected}, got {got}")]
    TypeMismatch {
        record: String,
        field: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("Field '{field}' of record '{record}' cannot be written directly")]
    ReadOnlyField { record: String, field: String },
}

impl RecordSchema {
    pub fn new(name: impl Into<String>, fields: Vec<(&str, FieldType)>) -> Self {
        Self {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(name, field_type)| FieldDef {
                    name: name.to_string(),
                    field_type,
                })
                .collect(),
            tenant_scoped: false,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Storage table name (lowercase identifier)
    pub fn table_name(&self) -> String {
        slug(&self.name)
    }

    /// Validate field names and uniqueness
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = std::collections::BTreeSet::new();
        for field in &self.fields {
            if !is_identifier(&field.name) || field.name == ID_FIELD || field.name == TENANT_FIELD {
                return Err(SchemaError::InvalidFieldName(field.name.clone()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    record: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Normalize a single field value to its canonical stored form.
    ///
    /// Every backend stores exactly what this returns, which is what keeps the
    /// backends in agreement: ints are integral numbers, bools are bools, text
    /// is text, json is left as-is. Null is always accepted.
    pub fn normalize_field(&self, field: &str, value: &Val) -> Result<Val, SchemaError> {
        if field == ID_FIELD {
            return Err(SchemaError::ReadOnlyField {
                record: self.name.clone(),
                field: field.to_string(),
            });
        }
        let def = self.field(field).ok_or_else(|| SchemaError::UnknownField {
            record: self.name.clone(),
            field: field.to_string(),
        })?;
        let mismatch = || SchemaError::TypeMismatch {
            record: self.name.clone(),
            field: field.to_string(),
            expected: def.field_type.as_str(),
            got: value.kind(),
        };
        match (def.field_type, value) {
            (_, Val::Null) => Ok(Val::Null),
            (FieldType::Text, Val::Str(_)) => Ok(value.clone()),
            (FieldType::Int, Val::Num(n)) if n.fract() == 0.0 && n.is_finite() => Ok(Val::Num(*n)),
            (FieldType::Number, Val::Num(n)) if n.is_finite() => Ok(Val::Num(*n)),
            (FieldType::Bool, Val::Bool(_)) => Ok(value.clone()),
            (FieldType::Json, Val::Task { .. }) => Err(mismatch()),
            (FieldType::Json, _) => Ok(value.clone()),
            _ => Err(mismatch()),
        }
    }

    /// Normalize a full record for insertion. Missing fields become null.
    pub fn normalize_record(&self, values: &Record) -> Result<Record, SchemaError> {
        for key in values.keys() {
            if key != ID_FIELD && self.field(key).is_none() {
                return Err(SchemaError::UnknownField {
                    record: self.name.clone(),
                    field: key.clone(),
                });
            }
        }
        let mut out = Record::new();
        for def in &self.fields {
            let value = values.get(&def.name).cloned().unwrap_or(Val::Null);
            out.insert(def.name.clone(), self.normalize_field(&def.name, &value)?);
        }
        Ok(out)
    }

    /// Normalize a partial change set (only the listed fields)
    pub fn normalize_changes(&self, changes: &Record) -> Result<Record, SchemaError> {
        changes
            .iter()
            .map(|(field, value)| Ok((field.clone(), self.normalize_field(field, value)?)))
            .collect()
    }
}

/// Lowercase identifier safe to use as a SQL table or column name
pub fn slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
