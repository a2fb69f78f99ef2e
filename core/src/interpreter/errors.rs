//! Engine error taxonomy
//!
//! Every handler returns `Result<_, EngineError>`. An error carries its kind,
//! a human message, the source location of the statement that raised it and
//! a machine-readable detail payload. Reason codes are stable strings.

use super::types::SchemaError;
use crate::storage::StorageError;
use serde::Serialize;

/* ===================== Reason Codes ===================== */

// Capability gate
pub const PATH_OUTSIDE_ROOT: &str = "path_outside_root";
pub const GUARANTEE_DENIED: &str = "guarantee_denied";

// Mutation policy
pub const MUTATION_DISABLED: &str = "mutation_disabled";
pub const POLICY_MISSING: &str = "policy_missing";
pub const AUDIT_REQUIRED: &str = "audit_required";
pub const POLICY_INVALID: &str = "policy_invalid";
pub const ACCESS_DENIED: &str = "access_denied";

// Structural purity
pub const MUTATION_IN_FUNCTION: &str = "mutation_in_function";
pub const FIND_IN_FUNCTION: &str = "find_in_function";
pub const EFFECT_IN_FUNCTION: &str = "effect_in_function";
pub const MUTATION_IN_PARALLEL: &str = "mutation_in_parallel";
pub const STATE_IN_PARALLEL: &str = "state_in_parallel";
pub const CONSTANT_REASSIGNMENT: &str = "constant_reassignment";

// Async tasks
pub const ASYNC_TARGET_INVALID: &str = "async_target_invalid";
pub const ASYNC_TASK_UNKNOWN: &str = "async_task_unknown";
pub const ASYNC_TASK_FAILED: &str = "async_task_failed";

// Predicate pushdown
pub const NON_SCALAR_COMPARISON: &str = "non_scalar_comparison";
pub const INCOMPATIBLE_COMPARISON: &str = "incompatible_comparison";
pub const UNKNOWN_FIELD: &str = "unknown_field";

// Parallel merge
pub const MERGE_CONFLICT: &str = "merge_conflict";
pub const NO_SUCCESSFUL_BRANCH: &str = "no_successful_branch";
pub const BRANCH_FAILED: &str = "branch_failed";
pub const INVALID_PRECEDENCE: &str = "invalid_precedence";

// Runtime
pub const UNKNOWN_VARIABLE: &str = "unknown_variable";
pub const UNKNOWN_FLOW: &str = "unknown_flow";
pub const UNKNOWN_RECORD: &str = "unknown_record";
pub const UNKNOWN_FUNCTION: &str = "unknown_function";
pub const UNKNOWN_TOOL: &str = "unknown_tool";
pub const UNKNOWN_PIPELINE: &str = "unknown_pipeline";
pub const UNKNOWN_AI_PROFILE: &str = "unknown_ai_profile";
pub const TYPE_ERROR: &str = "type_error";
pub const DIVISION_BY_ZERO: &str = "division_by_zero";
pub const WRONG_ARG_COUNT: &str = "wrong_arg_count";
pub const INVALID_RECORD: &str = "invalid_record";
pub const RECURSIVE_FLOW: &str = "recursive_flow";
pub const LIMIT_EXCEEDED: &str = "limit_exceeded";
pub const TOOL_FAILED: &str = "tool_failed";
pub const AI_FAILED: &str = "ai_failed";

// Storage
pub const STORAGE_FAILURE: &str = "storage_failure";

/* ===================== Error Types ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CapabilityViolation,
    PolicyDenied,
    IllegalEffect,
    Reassignment,
    AsyncTask,
    PredicatePushdown,
    MergeConflict,
    Runtime,
    Storage,
}

impl ErrorKind {
    pub fn category(self) -> &'static str {
        match self {
            ErrorKind::CapabilityViolation => "capability",
            ErrorKind::PolicyDenied => "policy",
            ErrorKind::IllegalEffect => "illegal_effect",
            ErrorKind::Reassignment => "reassignment",
            ErrorKind::AsyncTask => "async",
            ErrorKind::PredicatePushdown => "pushdown",
            ErrorKind::MergeConflict => "orchestration",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

/// Structured payload callers use to render an error without re-deriving context
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorDetails {
    pub category: String,
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    pub details: ErrorDetails,
}

impl EngineError {
    pub fn new(kind: ErrorKind, reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fix_hint: None,
            location: None,
            details: ErrorDetails {
                category: kind.category().to_string(),
                reason_code: reason_code.to_string(),
                ..ErrorDetails::default()
            },
        }
    }

    pub fn runtime(reason_code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, reason_code, message)
    }

    pub fn illegal_effect(reason_code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalEffect, reason_code, message)
    }

    pub fn async_task(reason_code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AsyncTask, reason_code, message)
    }

    pub fn pushdown(reason_code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PredicatePushdown, reason_code, message)
    }

    pub fn reason_code(&self) -> &str {
        &self.details.reason_code
    }

    /// Errors that are never captured on an async task or parallel branch.
    /// They abort the run from wherever they are raised.
    pub fn escalates(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::CapabilityViolation
                | ErrorKind::PolicyDenied
                | ErrorKind::IllegalEffect
                | ErrorKind::Reassignment
                | ErrorKind::PredicatePushdown
                | ErrorKind::Storage
        )
    }

    /// Attach a source location unless an inner statement already did
    pub fn at(mut self, line: u32, column: u32) -> Self {
        if self.location.is_none() {
            self.location = Some(SourceLocation { line, column });
        }
        self
    }

    pub fn with_flow(mut self, flow: &str) -> Self {
        if self.details.flow_name.is_none() {
            self.details.flow_name = Some(flow.to_string());
        }
        self
    }

    pub fn with_record(mut self, record: &str) -> Self {
        self.details.record = Some(record.to_string());
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.details.capability = Some(capability.to_string());
        self
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.details.action = Some(action.to_string());
        self
    }

    pub fn with_step(mut self, step_id: &str) -> Self {
        if self.details.step_id.is_none() {
            self.details.step_id = Some(step_id.to_string());
        }
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

impl From<SchemaError> for EngineError {
    fn from(err: SchemaError) -> Self {
        EngineError::runtime(INVALID_RECORD, err.to_string())
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Schema(inner) => inner.into(),
            StorageError::Pushdown { reason_code, message } => EngineError::pushdown(reason_code, message),
            other => EngineError::new(ErrorKind::Storage, STORAGE_FAILURE, other.to_string()),
        }
    }
}
