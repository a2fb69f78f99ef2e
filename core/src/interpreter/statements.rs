//! Statement dispatcher
//!
//! One handler per statement kind. Structural rules (constants, pure
//! functions, parallel branches) are enforced here before anything is
//! evaluated; record writes go through the mutation policy before the
//! storage call.

use super::concurrency;
use super::context::{reassignment, ExecutionContext};
use super::errors::{self, EngineError};
use super::expressions::{eval, type_error};
use super::mutation::{self, MutationAction};
use super::parallel;
use super::trace::{MetricSample, TraceEvent};
use super::types::{Expr, FieldAssign, Predicate, Record, RecordSchema, SetTarget, Stmt, StmtKind, Val};
use crate::storage::{self, split_path, Filter};
use tracing::{debug, trace};

/// What the enclosing block does after a statement
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Continue,
    Return(Val),
}

/* ===================== Blocks ===================== */

pub fn exec_block(ctx: &mut ExecutionContext<'_>, body: &[Stmt]) -> Result<Control, EngineError> {
    for stmt in body {
        if let Control::Return(value) = exec_stmt(ctx, stmt)? {
            return Ok(Control::Return(value));
        }
    }
    Ok(Control::Continue)
}

/// Execute one statement, tagging any error with its location and step id
pub fn exec_stmt(ctx: &mut ExecutionContext<'_>, stmt: &Stmt) -> Result<Control, EngineError> {
    ctx.advance_step();
    let flow_name = ctx.flow_name.clone();
    let step_id = ctx.step_id(stmt.kind.name());
    trace!(step = %step_id, "Executing statement");

    dispatch(ctx, stmt).map_err(|err| {
        err.at(stmt.line, stmt.column)
            .with_flow(&flow_name)
            .with_step(&step_id)
    })
}

fn dispatch(ctx: &mut ExecutionContext<'_>, stmt: &Stmt) -> Result<Control, EngineError> {
    match &stmt.kind {
        StmtKind::Let { name, value, constant } => {
            if ctx.constants.contains(name) {
                return Err(reassignment(name));
            }
            let value = eval(ctx, value)?;
            ctx.locals.insert(name.clone(), value.clone());
            if *constant {
                ctx.constants.insert(name.clone());
            }
            ctx.last_value = value;
        }

        StmtKind::Set {
            target: SetTarget::Var { name },
            value,
        } => {
            if ctx.constants.contains(name) {
                return Err(reassignment(name));
            }
            if !ctx.locals.contains_key(name) {
                return Err(EngineError::runtime(
                    errors::UNKNOWN_VARIABLE,
                    format!("Cannot set '{}' before it is declared", name),
                )
                .with_hint(format!("Declare it first with `let {} = ...`.", name)));
            }
            let value = eval(ctx, value)?;
            ctx.locals.insert(name.clone(), value.clone());
            ctx.last_value = value;
        }

        StmtKind::Set {
            target: SetTarget::State { path },
            value,
        } => {
            if ctx.in_function() {
                return Err(EngineError::illegal_effect(
                    errors::EFFECT_IN_FUNCTION,
                    "Pure functions cannot write application state",
                ));
            }
            if ctx.parallel_mode {
                let branch = ctx.parallel_task.clone().unwrap_or_default();
                return Err(EngineError::illegal_effect(
                    errors::STATE_IN_PARALLEL,
                    format!("Parallel branch '{}' cannot change state.{}", branch, path.join(".")),
                )
                .with_hint("Return the value from the branch and set state after the parallel block."));
            }
            let value = eval(ctx, value)?;
            set_path(&mut ctx.state, path, value.clone())?;
            ctx.last_value = value;
        }

        StmtKind::If {
            test,
            then_body,
            else_body,
        } => {
            let branch = if eval(ctx, test)?.is_truthy() {
                then_body
            } else {
                else_body
            };
            return exec_block(ctx, branch);
        }

        StmtKind::ForEach { name, iterable, body } => {
            let items = match eval(ctx, iterable)? {
                Val::List(items) => items,
                other => return Err(type_error(format!("Cannot iterate over a {} value", other.kind()))),
            };
            for item in items {
                ctx.bind(name, item)?;
                if let Control::Return(value) = exec_block(ctx, body)? {
                    return Ok(Control::Return(value));
                }
            }
        }

        StmtKind::Repeat { count, body } => {
            let times = match eval(ctx, count)? {
                Val::Num(n) if n >= 0.0 && n.fract() == 0.0 => n as u64,
                other => {
                    return Err(type_error(format!(
                        "Repeat count must be a non-negative whole number, got {}",
                        other
                    )))
                }
            };
            for _ in 0..times {
                if let Control::Return(value) = exec_block(ctx, body)? {
                    return Ok(Control::Return(value));
                }
            }
        }

        StmtKind::RepeatWhile { test, body, limit } => {
            let max = limit.unwrap_or(ctx.config.limits.max_loop_iterations);
            let mut iterations = 0u64;
            while eval(ctx, test)?.is_truthy() {
                if iterations >= max {
                    return Err(EngineError::runtime(
                        errors::LIMIT_EXCEEDED,
                        format!("Repeat while loop is still running after {} iterations", max),
                    )
                    .with_hint("Make the loop condition turn false or raise the loop limit."));
                }
                iterations += 1;
                if let Control::Return(value) = exec_block(ctx, body)? {
                    return Ok(Control::Return(value));
                }
            }
        }

        StmtKind::Match {
            subject,
            cases,
            otherwise,
        } => {
            let subject = eval(ctx, subject)?;
            for case in cases {
                if eval(ctx, &case.pattern)? == subject {
                    return exec_block(ctx, &case.body);
                }
            }
            return exec_block(ctx, otherwise);
        }

        StmtKind::TryCatch {
            try_body,
            catch_var,
            catch_body,
        } => {
            ctx.recorder.step("decision_try", "try block", stmt.line, stmt.column);
            match exec_block(ctx, try_body) {
                Err(err) if err.escalates() => return Err(err),
                Err(err) => {
                    debug!(reason = err.reason_code(), "Caught error in try block");
                    ctx.recorder
                        .step("catch_taken", "catch block taken", stmt.line, stmt.column);
                    ctx.bind(catch_var, caught(&err))?;
                    return exec_block(ctx, catch_body);
                }
                Ok(control) => {
                    ctx.recorder
                        .step("catch_skipped", "catch block skipped", stmt.line, stmt.column);
                    return Ok(control);
                }
            }
        }

        StmtKind::Return { value } => {
            let value = match value {
                Some(expr) => eval(ctx, expr)?,
                None => Val::Null,
            };
            ctx.last_value = value.clone();
            return Ok(Control::Return(value));
        }

        StmtKind::Evaluate { expr } => {
            ctx.last_value = eval(ctx, expr)?;
        }

        StmtKind::Create { record, values, target } => {
            let row = write_one(ctx, MutationAction::Create, record, values)?;
            finish(ctx, target.as_deref(), row)?;
        }

        StmtKind::Save { record, values, target } => {
            let row = write_one(ctx, MutationAction::Save, record, values)?;
            finish(ctx, target.as_deref(), row)?;
        }

        StmtKind::Update {
            record,
            predicate,
            changes,
            target,
        } => {
            let rows = write_many(ctx, MutationAction::Update, record, predicate, changes)?;
            finish(ctx, target.as_deref(), rows)?;
        }

        StmtKind::Delete {
            record,
            predicate,
            target,
        } => {
            let rows = write_many(ctx, MutationAction::Delete, record, predicate, &[])?;
            finish(ctx, target.as_deref(), rows)?;
        }

        StmtKind::Find {
            record,
            predicate,
            target,
        } => {
            let rows = find(ctx, record, predicate.as_ref())?;
            finish(ctx, Some(target), rows)?;
        }

        StmtKind::Metric { name, value, labels } => {
            let value = eval(ctx, value)?;
            let sample = MetricSample {
                flow_name: ctx.flow_name.clone(),
                name: name.clone(),
                value,
                labels: labels.clone(),
            };
            ctx.observer.metric(&sample);
        }

        StmtKind::Log { level, message } => {
            let message = eval(ctx, message)?.to_string();
            let flow_name = ctx.flow_name.clone();
            ctx.observer.log(*level, &flow_name, &message);
        }

        StmtKind::Parallel {
            branches,
            merge,
            target,
        } => {
            let merged = parallel::run_parallel(ctx, branches, merge.as_ref())?;
            finish(ctx, target.as_deref(), merged)?;
        }

        StmtKind::AsyncLaunch { name, call } => {
            concurrency::launch(ctx, name, call, stmt.line, stmt.column)?;
        }

        StmtKind::AsyncAwait { name, target } => {
            let value = concurrency::await_task(ctx, name)?;
            finish(ctx, target.as_deref(), value)?;
        }
    }
    Ok(Control::Continue)
}

/// Bind the statement result to its target (if any) and make it the last value
fn finish(ctx: &mut ExecutionContext<'_>, target: Option<&str>, value: Val) -> Result<(), EngineError> {
    if let Some(name) = target {
        ctx.bind(name, value.clone())?;
    }
    ctx.last_value = value;
    Ok(())
}

/// The value a catch block sees for the error it caught
fn caught(err: &EngineError) -> Val {
    let mut map = Record::new();
    map.insert("kind".to_string(), Val::str(err.kind.category()));
    map.insert("reason".to_string(), Val::str(err.reason_code()));
    map.insert("message".to_string(), Val::str(err.message.clone()));
    if let Some(location) = err.location {
        map.insert("line".to_string(), Val::Num(f64::from(location.line)));
    }
    Val::Obj(map)
}

fn set_path(root: &mut Val, path: &[String], value: Val) -> Result<(), EngineError> {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut node = root;
    for key in parents {
        let Val::Obj(map) = node else {
            return Err(type_error(format!("state.{} is not an object", key)));
        };
        node = map.entry(key.clone()).or_insert_with(Val::obj);
        if node.is_null() {
            *node = Val::obj();
        }
    }
    match node {
        Val::Obj(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        other => Err(type_error(format!(
            "Cannot set state.{} inside a {} value",
            path.join("."),
            other.kind()
        ))),
    }
}

/* ===================== Records ===================== */

fn schema<'r>(ctx: &ExecutionContext<'r>, record: &str) -> Result<&'r RecordSchema, EngineError> {
    let program = ctx.program;
    program.record(record).ok_or_else(|| {
        EngineError::runtime(errors::UNKNOWN_RECORD, format!("Unknown record '{}'", record)).with_record(record)
    })
}

fn guard_mutation(ctx: &ExecutionContext<'_>, action: MutationAction, record: &str) -> Result<(), EngineError> {
    if ctx.in_function() {
        let function = ctx.call_stack.last().cloned().unwrap_or_default();
        return Err(EngineError::illegal_effect(
            errors::MUTATION_IN_FUNCTION,
            format!("Function '{}' is pure and cannot {} '{}'", function, action.as_str(), record),
        )
        .with_record(record)
        .with_action(action.as_str())
        .with_hint("Perform record writes in the calling flow."));
    }
    if ctx.parallel_mode {
        let branch = ctx.parallel_task.clone().unwrap_or_default();
        return Err(EngineError::illegal_effect(
            errors::MUTATION_IN_PARALLEL,
            format!("Parallel branch '{}' cannot {} '{}'", branch, action.as_str(), record),
        )
        .with_record(record)
        .with_action(action.as_str())
        .with_hint("Return the data from the branch and write it after the merge."));
    }
    Ok(())
}

fn eval_record(ctx: &mut ExecutionContext<'_>, values: &Expr) -> Result<Record, EngineError> {
    match eval(ctx, values)? {
        Val::Obj(map) => Ok(map),
        other => Err(type_error(format!("Record values must be an object, got {}", other.kind()))),
    }
}

fn record_written(ctx: &mut ExecutionContext<'_>, step_id: String, record: &str, action: MutationAction, count: usize) {
    ctx.trace(TraceEvent::RecordWrite {
        step_id,
        record: record.to_string(),
        verb: action.verb().to_string(),
        count,
    });
}

/// `create` / `save`: one row in, one row out
fn write_one(
    ctx: &mut ExecutionContext<'_>,
    action: MutationAction,
    record: &str,
    values: &Expr,
) -> Result<Val, EngineError> {
    guard_mutation(ctx, action, record)?;
    let schema = schema(ctx, record)?;
    let step_id = ctx.step_id(action.as_str());
    mutation::authorize(ctx, action, record, &step_id)?;

    let values = eval_record(ctx, values)?;
    let written = match action {
        MutationAction::Save => ctx.store.save(schema, &values, &ctx.scope),
        _ => ctx.store.create(schema, &values, &ctx.scope),
    }
    .map_err(|err| EngineError::from(err).with_record(record))?;

    record_written(ctx, step_id, record, action, 1);
    Ok(Val::Obj(written))
}

/// `update` / `delete`: every row matching the predicate
fn write_many(
    ctx: &mut ExecutionContext<'_>,
    action: MutationAction,
    record: &str,
    predicate: &Predicate,
    changes: &[FieldAssign],
) -> Result<Val, EngineError> {
    guard_mutation(ctx, action, record)?;
    let schema = schema(ctx, record)?;
    let step_id = ctx.step_id(action.as_str());
    mutation::authorize(ctx, action, record, &step_id)?;

    let filter = resolve_predicate(ctx, predicate)?;
    let plan = storage::plan(schema, &filter).map_err(|err| EngineError::from(err).with_record(record))?;
    let rows = match action {
        MutationAction::Delete => ctx.store.delete(schema, &plan, &ctx.scope),
        _ => {
            let mut assigned = Record::new();
            for change in changes {
                assigned.insert(change.field.clone(), eval(ctx, &change.value)?);
            }
            ctx.store.update(schema, &plan, &assigned, &ctx.scope)
        }
    }
    .map_err(|err| EngineError::from(err).with_record(record))?;

    record_written(ctx, step_id, record, action, rows.len());
    Ok(Val::List(rows.into_iter().map(Val::Obj).collect()))
}

fn find(ctx: &mut ExecutionContext<'_>, record: &str, predicate: Option<&Predicate>) -> Result<Val, EngineError> {
    if ctx.in_function() {
        let function = ctx.call_stack.last().cloned().unwrap_or_default();
        return Err(EngineError::illegal_effect(
            errors::FIND_IN_FUNCTION,
            format!("Function '{}' is pure and cannot read '{}' records", function, record),
        )
        .with_record(record)
        .with_hint("Find the records in the calling flow and pass them in."));
    }
    let schema = schema(ctx, record)?;
    let step_id = ctx.step_id("find");

    let filter = match predicate {
        Some(predicate) => resolve_predicate(ctx, predicate)?,
        None => Filter::All,
    };
    let plan = storage::plan(schema, &filter).map_err(|err| EngineError::from(err).with_record(record))?;
    let rows = ctx
        .store
        .find(schema, &plan, &ctx.scope)
        .map_err(|err| EngineError::from(err).with_record(record))?;

    ctx.trace(TraceEvent::StatementFind {
        step_id,
        record: record.to_string(),
        count: rows.len(),
        pushdown: plan.is_pushdown(),
        sql_reason: plan.sql_reason.clone(),
    });
    Ok(Val::List(rows.into_iter().map(Val::Obj).collect()))
}

/// Evaluate every operand of a `where` clause into a value-bound filter
pub fn resolve_predicate(ctx: &mut ExecutionContext<'_>, predicate: &Predicate) -> Result<Filter, EngineError> {
    Ok(match predicate {
        Predicate::Compare { field, op, value } => Filter::Compare {
            path: split_path(field),
            op: *op,
            value: eval(ctx, value)?,
        },
        Predicate::Contains { field, value } => Filter::Contains {
            path: split_path(field),
            value: eval(ctx, value)?,
        },
        Predicate::And { items } => Filter::And {
            items: resolve_all(ctx, items)?,
        },
        Predicate::Or { items } => Filter::Or {
            items: resolve_all(ctx, items)?,
        },
        Predicate::Not { inner } => Filter::Not {
            inner: Box::new(resolve_predicate(ctx, inner)?),
        },
    })
}

fn resolve_all(ctx: &mut ExecutionContext<'_>, items: &[Predicate]) -> Result<Vec<Filter>, EngineError> {
    items.iter().map(|item| resolve_predicate(ctx, item)).collect()
}

/* ===================== Steps ===================== */

/// Human-facing summary of a statement for the execution step list
pub fn describe(stmt: &Stmt) -> String {
    match &stmt.kind {
        StmtKind::Let { name, constant: true, .. } => format!("let constant {}", name),
        StmtKind::Let { name, .. } => format!("let {}", name),
        StmtKind::Set {
            target: SetTarget::Var { name },
            ..
        } => format!("set {}", name),
        StmtKind::Set {
            target: SetTarget::State { path },
            ..
        } => format!("set state.{}", path.join(".")),
        StmtKind::If { .. } => "if".to_string(),
        StmtKind::ForEach { name, .. } => format!("for each {}", name),
        StmtKind::Repeat { .. } => "repeat".to_string(),
        StmtKind::RepeatWhile { .. } => "repeat while".to_string(),
        StmtKind::Match { cases, .. } => format!("match ({} cases)", cases.len()),
        StmtKind::TryCatch { catch_var, .. } => format!("try, catching {}", catch_var),
        StmtKind::Return { .. } => "return".to_string(),
        StmtKind::Evaluate { expr } if expr.is_call() => "call".to_string(),
        StmtKind::Evaluate { .. } => "evaluate".to_string(),
        StmtKind::Create { record, .. } => format!("create {}", record),
        StmtKind::Save { record, .. } => format!("save {}", record),
        StmtKind::Update { record, .. } => format!("update {}", record),
        StmtKind::Delete { record, .. } => format!("delete {}", record),
        StmtKind::Find { record, .. } => format!("find {}", record),
        StmtKind::Metric { name, .. } => format!("metric {}", name),
        StmtKind::Log { .. } => "log".to_string(),
        StmtKind::Parallel { branches, .. } => format!("parallel ({} branches)", branches.len()),
        StmtKind::AsyncLaunch { name, .. } => format!("launch {}", name),
        StmtKind::AsyncAwait { name, .. } => format!("await {}", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_path_creates_intermediate_objects() {
        let mut state = Val::obj();
        set_path(&mut state, &["a".to_string(), "b".to_string()], Val::Num(1.0)).unwrap();
        assert_eq!(
            state.get_path(&["a".to_string(), "b".to_string()]),
            Some(&Val::Num(1.0))
        );
    }

    #[test]
    fn test_set_path_through_scalar_is_a_type_error() {
        let mut state = Val::obj();
        set_path(&mut state, &["a".to_string()], Val::Num(1.0)).unwrap();
        let err = set_path(&mut state, &["a".to_string(), "b".to_string()], Val::Null).unwrap_err();
        assert_eq!(err.reason_code(), errors::TYPE_ERROR);
    }

    #[test]
    fn test_describe_names_the_record() {
        let stmt: Stmt = serde_json::from_str(
            r#"{"t": "Find", "record": "Item", "target": "items", "line": 3, "column": 1}"#,
        )
        .unwrap();
        assert_eq!(describe(&stmt), "find Item");
        assert_eq!(stmt.line, 3);
    }
}
