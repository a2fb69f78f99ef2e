//! Flow runs
//!
//! [`Engine::run`] drives one flow from start to finish: it enforces the
//! flow-level `requires` rule, opens a store transaction, runs the top-level
//! statements, persists application state and commits. On failure the
//! transaction is rolled back and the partial trace is handed back with the
//! error. The optional `last_execution.json` artifact is written either way.

use super::context::{ExecutionContext, Providers};
use super::errors::{self, EngineError, ErrorKind};
use super::expressions::eval;
use super::statements::{describe, exec_stmt, Control};
use super::trace::{trace_digest, ExecutionStep, TraceEvent};
use super::types::{Flow, Program, Val};
use crate::config::EngineConfig;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ARTIFACT_FILE: &str = "last_execution.json";

/// What to run and with which inputs
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub flow: String,
    pub input: Val,
    pub identity: Val,
    /// Used instead of the store's persisted state when present
    pub initial_state: Option<Val>,
}

impl RunRequest {
    pub fn new(flow: impl Into<String>) -> Self {
        Self {
            flow: flow.into(),
            ..Self::default()
        }
    }

    pub fn input(mut self, input: Val) -> Self {
        self.input = input;
        self
    }

    pub fn identity(mut self, identity: Val) -> Self {
        self.identity = identity;
        self
    }

    pub fn initial_state(mut self, state: Val) -> Self {
        self.initial_state = Some(state);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub flow_name: String,
    pub state: Val,
    pub last_value: Val,
    pub traces: Vec<TraceEvent>,
    pub steps: Vec<ExecutionStep>,
    pub trace_digest: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A failed run: the error plus everything recorded before it
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("Flow run failed: {error}")]
pub struct RunError {
    pub run_id: String,
    pub error: EngineError,
    pub traces: Vec<TraceEvent>,
    pub steps: Vec<ExecutionStep>,
    pub trace_digest: String,
}

/// A lowered program bound to its configuration
#[derive(Debug, Clone)]
pub struct Engine {
    program: Program,
    config: EngineConfig,
}

impl Engine {
    pub fn new(program: Program, config: EngineConfig) -> Self {
        Self { program, config }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn run<'a>(
        &'a self,
        store: &'a mut dyn Storage,
        providers: Providers<'a>,
        request: RunRequest,
    ) -> Result<ExecutionResult, RunError> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let Some(flow) = self.program.flow(&request.flow) else {
            let error = EngineError::runtime(errors::UNKNOWN_FLOW, format!("Unknown flow '{}'", request.flow));
            return Err(RunError {
                run_id,
                error,
                traces: Vec::new(),
                steps: Vec::new(),
                trace_digest: trace_digest(&[]),
            });
        };

        info!(flow = %flow.name, run_id = %run_id, backend = store.kind(), "Starting flow run");
        let mut ctx = ExecutionContext::new(&self.program, &self.config, store, providers, flow, request.identity);
        if let Some(obj) = request.input.as_obj() {
            ctx.locals.extend(obj.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        ctx.locals.insert("input".to_string(), request.input);

        ctx.recorder.step("flow_start", flow.name.clone(), flow.line, flow.column);
        let mut began = false;
        let outcome = execute(&mut ctx, flow, request.initial_state, &mut began);

        if let Err(err) = &outcome {
            let location = err.location.unwrap_or(errors::SourceLocation {
                line: flow.line,
                column: flow.column,
            });
            ctx.recorder.step("error", err.message.clone(), location.line, location.column);
            if began {
                if let Err(rollback) = ctx.store.rollback() {
                    warn!(flow = %flow.name, "Rollback failed: {}", rollback);
                }
            }
            ctx.trace(TraceEvent::runtime_error(&flow.name, err));
            warn!(flow = %flow.name, reason = err.reason_code(), "Flow run failed: {}", err);
        }
        ctx.recorder.step("flow_end", flow.name.clone(), flow.line, flow.column);

        let digest = ctx.recorder.digest();
        if let Some(dir) = &self.config.artifacts.dir {
            if let Err(e) = write_artifact(dir, &run_id, &flow.name, &ctx, outcome.as_ref().err(), &digest) {
                warn!(dir = %dir.display(), "Failed to write execution artifact: {}", e);
            }
        }

        let traces = std::mem::take(&mut ctx.recorder.events);
        let steps = std::mem::take(&mut ctx.recorder.steps);
        match outcome {
            Ok(()) => {
                info!(flow = %flow.name, run_id = %run_id, events = traces.len(), "Flow run finished");
                Ok(ExecutionResult {
                    run_id,
                    flow_name: flow.name.clone(),
                    state: ctx.state,
                    last_value: ctx.last_value,
                    traces,
                    steps,
                    trace_digest: digest,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(error) => Err(RunError {
                run_id,
                error,
                traces,
                steps,
                trace_digest: digest,
            }),
        }
    }
}

fn execute(
    ctx: &mut ExecutionContext<'_>,
    flow: &Flow,
    initial_state: Option<Val>,
    began: &mut bool,
) -> Result<(), EngineError> {
    enforce_flow_requires(ctx, flow)?;

    ctx.store.begin()?;
    *began = true;
    ctx.state = match initial_state {
        Some(state) => state,
        None => ctx.store.load_state()?.unwrap_or_else(Val::obj),
    };

    for stmt in &flow.body {
        let control = exec_stmt(ctx, stmt)?;
        ctx.recorder
            .step(stmt.kind.name(), describe(stmt), stmt.line, stmt.column);
        if let Control::Return(value) = control {
            ctx.last_value = value;
            break;
        }
    }

    ctx.store.save_state(&ctx.state)?;
    ctx.store.commit()?;
    debug!(flow = %flow.name, "Committed flow run");
    Ok(())
}

/// Enforce a `requires` rule that does not depend on the `mutation` binding.
/// Rules that mention `mutation` are left to the mutation policy.
pub fn enforce_flow_requires(ctx: &mut ExecutionContext<'_>, flow: &Flow) -> Result<(), EngineError> {
    let Some(requires) = &flow.requires else {
        return Ok(());
    };
    if requires.mentions_mutation() {
        return Ok(());
    }
    let denied = |reason: &str, message: String| {
        EngineError::new(ErrorKind::PolicyDenied, reason, message)
            .with_flow(&flow.name)
            .at(flow.line, flow.column)
            .with_hint("Run the flow with an identity that satisfies its requires rule.")
    };
    match eval(ctx, requires) {
        Ok(Val::Bool(true)) => Ok(()),
        Ok(Val::Bool(false)) => Err(denied(
            errors::ACCESS_DENIED,
            format!("Requires rule of flow '{}' is not satisfied", flow.name),
        )),
        Ok(other) => Err(denied(
            errors::POLICY_INVALID,
            format!(
                "Requires rule of flow '{}' produced {} instead of a boolean",
                flow.name,
                other.kind()
            ),
        )),
        Err(err) => Err(denied(
            errors::POLICY_INVALID,
            format!("Requires rule of flow '{}' could not be evaluated: {}", flow.name, err),
        )),
    }
}

fn write_artifact(
    dir: &Path,
    run_id: &str,
    flow_name: &str,
    ctx: &ExecutionContext<'_>,
    error: Option<&EngineError>,
    digest: &str,
) -> std::io::Result<()> {
    let mut summary: BTreeMap<&str, usize> = BTreeMap::new();
    for event in &ctx.recorder.events {
        *summary.entry(event.name()).or_default() += 1;
    }
    let artifact = json!({
        "ok": error.is_none(),
        "run_id": run_id,
        "flow_name": flow_name,
        "steps": ctx.recorder.steps,
        "traces": ctx.recorder.events,
        "summary": {
            "statements": ctx.recorder.steps.iter().filter(|s| !matches!(s.kind.as_str(), "flow_start" | "flow_end" | "error")).count(),
            "events": summary,
        },
        "error": error,
        "trace_digest": digest,
    });
    std::fs::create_dir_all(dir)?;
    let bytes = serde_json::to_vec_pretty(&artifact)?;
    std::fs::write(dir.join(ARTIFACT_FILE), bytes)
}
