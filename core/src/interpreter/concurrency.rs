//! Async task table
//!
//! `launch` evaluates its call eagerly against a snapshot of the bindings and
//! stores the outcome; `await` hands the stored outcome back. Nothing ever
//! blocks and await order has no influence on the trace.

use super::context::{reassignment, ExecutionContext};
use super::errors::{self, EngineError, SourceLocation};
use super::expressions::eval;
use super::trace::TraceEvent;
use super::types::{Expr, Val};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct AsyncTask {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub outcome: Result<Val, EngineError>,
    pub location: SourceLocation,
}

impl AsyncTask {
    /// Move a running task to its terminal status; terminal tasks are left as is
    fn finalize(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = match self.outcome {
            Ok(_) => TaskStatus::Completed,
            Err(_) => TaskStatus::Failed,
        };
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    tasks: BTreeMap<String, AsyncTask>,
    launched: u64,
}

impl TaskTable {
    pub fn get(&self, task_id: &str) -> Option<&AsyncTask> {
        self.tasks.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Launch `call` as task `name`, binding a task handle under that name
pub fn launch(
    ctx: &mut ExecutionContext<'_>,
    name: &str,
    call: &Expr,
    line: u32,
    column: u32,
) -> Result<Val, EngineError> {
    if !call.is_call() {
        return Err(EngineError::async_task(
            errors::ASYNC_TARGET_INVALID,
            format!("Async task '{}' must launch a tool, function, flow, pipeline or AI call", name),
        )
        .with_hint("Wrap the computation in a function and launch a call to it."));
    }
    if ctx.constants.contains(name) {
        return Err(reassignment(name));
    }
    let max = ctx.config.limits.max_async_tasks;
    if ctx.tasks.len() >= max {
        return Err(EngineError::runtime(
            errors::LIMIT_EXCEEDED,
            format!("More than {} async tasks launched in one run", max),
        ));
    }

    ctx.tasks.launched += 1;
    let task_id = format!("{}:async:{}:{}", ctx.flow_name, ctx.tasks.launched, name);
    let saved = ctx.snapshot();
    let outcome = eval(ctx, call);
    ctx.restore(saved);

    let outcome = match outcome {
        Err(err) if err.escalates() => return Err(err),
        other => other,
    };
    debug!(task = %task_id, ok = outcome.is_ok(), "Async task evaluated");
    let task = AsyncTask {
        id: task_id.clone(),
        name: name.to_string(),
        status: TaskStatus::Running,
        outcome,
        location: SourceLocation { line, column },
    };

    ctx.tasks.tasks.insert(task_id.clone(), task);
    let handle = Val::Task {
        task_id: task_id.clone(),
    };
    ctx.bind(name, handle.clone())?;
    ctx.trace(TraceEvent::AsyncTaskLaunched {
        task_id,
        name: name.to_string(),
        status: TaskStatus::Running.as_str().to_string(),
        line,
        column,
    });
    Ok(handle)
}

/// Resolve the task bound under `name` and return its result
pub fn await_task(ctx: &mut ExecutionContext<'_>, name: &str) -> Result<Val, EngineError> {
    let task_id = match ctx.lookup(name) {
        Some(Val::Task { task_id }) => task_id,
        _ => {
            return Err(EngineError::async_task(
                errors::ASYNC_TASK_UNKNOWN,
                format!("'{}' is not an async task launched in this run", name),
            ))
        }
    };
    let task = ctx.tasks.tasks.get_mut(&task_id).ok_or_else(|| {
        EngineError::async_task(
            errors::ASYNC_TASK_UNKNOWN,
            format!("Async task '{}' is not known to this run", task_id),
        )
    })?;
    task.finalize();

    match &task.outcome {
        Ok(value) => Ok(value.clone()),
        Err(cause) => Err(EngineError::async_task(
            errors::ASYNC_TASK_FAILED,
            format!("Async task '{}' failed: {}", task.name, cause.message),
        )
        .at(task.location.line, task.location.column)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_is_idempotent() {
        let mut task = AsyncTask {
            id: "main:async:1:a".to_string(),
            name: "a".to_string(),
            status: TaskStatus::Running,
            outcome: Ok(Val::Num(1.0)),
            location: SourceLocation { line: 1, column: 1 },
        };
        task.finalize();
        assert_eq!(task.status, TaskStatus::Completed);
        task.outcome = Err(EngineError::runtime(errors::TYPE_ERROR, "late"));
        task.finalize();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_failed_outcome_finalizes_to_failed() {
        let mut task = AsyncTask {
            id: "main:async:1:b".to_string(),
            name: "b".to_string(),
            status: TaskStatus::Running,
            outcome: Err(EngineError::runtime(errors::TOOL_FAILED, "boom")),
            location: SourceLocation { line: 2, column: 1 },
        };
        task.finalize();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.status.is_terminal());
    }
}
