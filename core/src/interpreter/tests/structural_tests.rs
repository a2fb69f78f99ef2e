//! Tests for structural rules: pure functions, parallel branches, constants

use super::helpers::{permissive, Runner};
use crate::interpreter::errors;
use crate::interpreter::{ErrorKind, RunRequest, TraceEvent, Val};

fn function_program(function_body: &str) -> String {
    format!(
        r#"{{
        "records": [{{"name": "Item", "fields": [{{"name": "name", "type": "text"}}]}}],
        "tools": [{{"name": "lookup"}}],
        "functions": [{{"name": "helper", "params": [], "body": [{function_body}]}}],
        "flows": [{{"name": "main", "body": [
            {{"t": "Evaluate", "line": 7, "column": 1,
              "expr": {{"t": "CallFunction", "name": "helper", "args": []}}}}
        ]}}]
    }}"#
    )
}

#[test]
fn test_find_in_pure_function_is_illegal() {
    let failure = Runner::new(
        &function_program(r#"{"t": "Find", "record": "Item", "target": "rows"}"#),
        permissive(),
    )
    .run(RunRequest::new("main"))
    .err();
    assert_eq!(failure.error.kind, ErrorKind::IllegalEffect);
    assert_eq!(failure.error.reason_code(), errors::FIND_IN_FUNCTION);
    assert!(failure.traces.iter().all(|e| !matches!(e, TraceEvent::StatementFind { .. })));
}

#[test]
fn test_create_in_pure_function_is_illegal_before_policy() {
    let failure = Runner::new(
        &function_program(
            r#"{"t": "Create", "record": "Item",
                "values": {"t": "Map", "entries": [{"key": "name", "value": {"t": "Lit", "v": "x"}}]}}"#,
        ),
        permissive(),
    )
    .run(RunRequest::new("main"))
    .err();
    assert_eq!(failure.error.kind, ErrorKind::IllegalEffect);
    assert_eq!(failure.error.reason_code(), errors::MUTATION_IN_FUNCTION);
    assert_eq!(failure.error.details.record.as_deref(), Some("Item"));
    assert!(failure
        .traces
        .iter()
        .all(|e| !matches!(e, TraceEvent::MutationAllowed { .. } | TraceEvent::RecordWrite { .. })));
}

#[test]
fn test_tool_call_in_pure_function_is_illegal() {
    let outcome = Runner::new(
        &function_program(r#"{"t": "Evaluate", "expr": {"t": "CallTool", "name": "lookup", "args": []}}"#),
        permissive(),
    )
    .run(RunRequest::new("main"));
    assert!(outcome.tools.calls.is_empty());
    let failure = outcome.err();
    assert_eq!(failure.error.reason_code(), errors::EFFECT_IN_FUNCTION);
}

#[test]
fn test_mutation_in_parallel_branch_is_illegal() {
    let program = r#"{
        "records": [{"name": "Item", "fields": [{"name": "name", "type": "text"}]}],
        "flows": [{"name": "main", "body": [
            {"t": "Parallel", "line": 2, "column": 1, "branches": [
                {"name": "reader", "body": [{"t": "Return", "value": {"t": "Lit", "v": 1}}]},
                {"name": "writer", "body": [
                    {"t": "Create", "record": "Item", "line": 5, "column": 5,
                     "values": {"t": "Map", "entries": [{"key": "name", "value": {"t": "Lit", "v": "x"}}]}}
                ]}
            ]}
        ]}]
    }"#;
    let failure = Runner::new(program, permissive()).run(RunRequest::new("main")).err();
    assert_eq!(failure.error.kind, ErrorKind::IllegalEffect);
    assert_eq!(failure.error.reason_code(), errors::MUTATION_IN_PARALLEL);
    assert_eq!(failure.error.location.map(|l| l.line), Some(5));

    let finished: Vec<(&str, &str)> = failure
        .traces
        .iter()
        .filter_map(|e| match e {
            TraceEvent::OrchestrationBranchFinished { branch, status, .. } => Some((branch.as_str(), status.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![("reader", "completed"), ("writer", "failed")]);
    assert!(failure
        .traces
        .iter()
        .all(|e| !matches!(e, TraceEvent::OrchestrationMergeStarted { .. })));
}

#[test]
fn test_constant_reassignment_fails_before_evaluating() {
    let program = r#"{
        "tools": [{"name": "count"}],
        "flows": [{"name": "main", "body": [
            {"t": "Let", "name": "limit", "constant": true, "value": {"t": "Lit", "v": 5}},
            {"t": "Set", "line": 3, "column": 1, "target": {"t": "Var", "name": "limit"},
             "value": {"t": "CallTool", "name": "count", "args": []}}
        ]}]
    }"#;
    let outcome = Runner::new(program, permissive()).run(RunRequest::new("main"));
    assert!(outcome.tools.calls.is_empty());
    let failure = outcome.err();
    assert_eq!(failure.error.kind, ErrorKind::Reassignment);
    assert_eq!(failure.error.reason_code(), errors::CONSTANT_REASSIGNMENT);
    assert_eq!(failure.error.location.map(|l| l.line), Some(3));
}

#[test]
fn test_constant_cannot_be_redeclared() {
    let program = r#"{"flows": [{"name": "main", "body": [
        {"t": "Let", "name": "x", "constant": true, "value": {"t": "Lit", "v": 1}},
        {"t": "Let", "name": "x", "value": {"t": "Lit", "v": 2}}
    ]}]}"#;
    let failure = Runner::new(program, permissive()).run(RunRequest::new("main")).err();
    assert_eq!(failure.error.kind, ErrorKind::Reassignment);
}

#[test]
fn test_set_requires_declaration() {
    let program = r#"{"flows": [{"name": "main", "body": [
        {"t": "Set", "target": {"t": "Var", "name": "ghost"}, "value": {"t": "Lit", "v": 1}}
    ]}]}"#;
    let failure = Runner::new(program, permissive()).run(RunRequest::new("main")).err();
    assert_eq!(failure.error.reason_code(), errors::UNKNOWN_VARIABLE);
}

#[test]
fn test_pure_function_computes_with_its_own_scope() {
    let program = r#"{
        "functions": [{"name": "double", "params": ["n"], "body": [
            {"t": "Return", "value": {"t": "Binary", "op": "mul",
                "left": {"t": "Var", "name": "n"}, "right": {"t": "Lit", "v": 2}}}
        ]}],
        "flows": [{"name": "main", "body": [
            {"t": "Let", "name": "n", "value": {"t": "Lit", "v": 100}},
            {"t": "Let", "name": "y", "value": {"t": "CallFunction", "name": "double",
                "args": [{"t": "Lit", "v": 21}]}},
            {"t": "Return", "value": {"t": "List", "items": [
                {"t": "Var", "name": "y"}, {"t": "Var", "name": "n"}]}}
        ]}]
    }"#;
    let result = Runner::new(program, permissive()).run(RunRequest::new("main")).ok();
    assert_eq!(result.last_value, Val::List(vec![Val::Num(42.0), Val::Num(100.0)]));
}

#[test]
fn test_function_arity_is_checked() {
    let program = r#"{
        "functions": [{"name": "id", "params": ["a"], "body": [{"t": "Return", "value": {"t": "Var", "name": "a"}}]}],
        "flows": [{"name": "main", "body": [
            {"t": "Evaluate", "expr": {"t": "CallFunction", "name": "id", "args": []}}
        ]}]
    }"#;
    let failure = Runner::new(program, permissive()).run(RunRequest::new("main")).err();
    assert_eq!(failure.error.reason_code(), errors::WRONG_ARG_COUNT);
}
