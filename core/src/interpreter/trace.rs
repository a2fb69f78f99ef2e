//! Trace/step recorder
//!
//! The trace is data handed back to the caller, not log output. It holds no
//! timestamps or random ids, so replaying the same program against the same
//! inputs and store snapshot produces a byte-identical stream.

use super::errors::EngineError;
use super::types::Val;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Layer that supplied the guarantee governing a capability decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuaranteeSource {
    Engine,
    Pack,
    Policy,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    MutationAllowed {
        step_id: String,
        flow_name: String,
        record: String,
        action: String,
    },
    MutationBlocked {
        step_id: String,
        flow_name: String,
        record: String,
        action: String,
        reason_code: String,
        message: String,
        fix_hint: String,
    },
    RecordWrite {
        step_id: String,
        record: String,
        verb: String,
        count: usize,
    },
    StatementFind {
        step_id: String,
        record: String,
        count: usize,
        pushdown: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sql_reason: Option<String>,
    },
    CapabilityCheck {
        step_id: String,
        capability: String,
        allowed: bool,
        source: GuaranteeSource,
        reason: String,
        subject: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        target: Option<String>,
    },
    FlowCallStarted {
        flow_name: String,
        caller: String,
    },
    FlowCallFinished {
        flow_name: String,
        caller: String,
        ok: bool,
    },
    PipelineStarted {
        pipeline: String,
        steps: Vec<String>,
    },
    PipelineFinished {
        pipeline: String,
        ok: bool,
    },
    ToolCall {
        step_id: String,
        tool: String,
        ok: bool,
    },
    BoundaryStarted {
        boundary: String,
        name: String,
    },
    BoundaryFinished {
        boundary: String,
        name: String,
        ok: bool,
    },
    AsyncTaskLaunched {
        task_id: String,
        name: String,
        status: String,
        line: u32,
        column: u32,
    },
    OrchestrationBranchStarted {
        block: String,
        branch: String,
    },
    OrchestrationBranchFinished {
        block: String,
        branch: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    OrchestrationMergeStarted {
        block: String,
        policy: String,
        branches: Vec<String>,
    },
    OrchestrationMergeFinished {
        block: String,
        policy: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        selected: Option<String>,
        failed: Vec<String>,
        precedence: Vec<String>,
        reason: String,
    },
    RuntimeError {
        flow_name: String,
        category: String,
        reason_code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        step_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        line: Option<u32>,
    },
}

impl TraceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::MutationAllowed { .. } => "mutation_allowed",
            TraceEvent::MutationBlocked { .. } => "mutation_blocked",
            TraceEvent::RecordWrite { .. } => "record_write",
            TraceEvent::StatementFind { .. } => "statement_find",
            TraceEvent::CapabilityCheck { .. } => "capability_check",
            TraceEvent::FlowCallStarted { .. } => "flow_call_started",
            TraceEvent::FlowCallFinished { .. } => "flow_call_finished",
            TraceEvent::PipelineStarted { .. } => "pipeline_started",
            TraceEvent::PipelineFinished { .. } => "pipeline_finished",
            TraceEvent::ToolCall { .. } => "tool_call",
            TraceEvent::BoundaryStarted { .. } => "boundary_started",
            TraceEvent::BoundaryFinished { .. } => "boundary_finished",
            TraceEvent::AsyncTaskLaunched { .. } => "async_task_launched",
            TraceEvent::OrchestrationBranchStarted { .. } => "orchestration_branch_started",
            TraceEvent::OrchestrationBranchFinished { .. } => "orchestration_branch_finished",
            TraceEvent::OrchestrationMergeStarted { .. } => "orchestration_merge_started",
            TraceEvent::OrchestrationMergeFinished { .. } => "orchestration_merge_finished",
            TraceEvent::RuntimeError { .. } => "runtime_error",
        }
    }

    pub fn runtime_error(flow_name: &str, err: &EngineError) -> Self {
        TraceEvent::RuntimeError {
            flow_name: flow_name.to_string(),
            category: err.details.category.clone(),
            reason_code: err.details.reason_code.clone(),
            message: err.message.clone(),
            step_id: err.details.step_id.clone(),
            line: err.location.map(|l| l.line),
        }
    }
}

/// Human-facing execution summary entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub kind: String,
    pub what: String,
    pub line: u32,
    pub column: u32,
}

/// Observability payload forwarded to the observer; never part of the trace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub flow_name: String,
    pub name: String,
    pub value: Val,
    pub labels: BTreeMap<String, String>,
}

/// Append-only event and step sink owned by the execution context
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    pub events: Vec<TraceEvent>,
    pub steps: Vec<ExecutionStep>,
}

impl Recorder {
    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn step(&mut self, kind: &str, what: impl Into<String>, line: u32, column: u32) {
        self.steps.push(ExecutionStep {
            kind: kind.to_string(),
            what: what.into(),
            line,
            column,
        });
    }

    pub fn digest(&self) -> String {
        trace_digest(&self.events)
    }
}

/// SHA-256 over the JSON-serialized event list, hex encoded
pub fn trace_digest(events: &[TraceEvent]) -> String {
    let bytes = serde_json::to_vec(events).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}
