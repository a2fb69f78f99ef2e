//! Type definitions for the engine
//!
//! This module contains the data the engine consumes:
//! - Lowered IR nodes (Stmt, Expr, Predicate, Program)
//! - Runtime values (Val)
//! - Record schemas (RecordSchema, FieldType)

pub mod ast;
pub mod schema;
pub mod values;

// Re-export all types for convenient access
pub use ast::*;
pub use schema::{FieldDef, FieldType, Record, RecordSchema, SchemaError, ID_FIELD, TENANT_FIELD};
pub use values::Val;
