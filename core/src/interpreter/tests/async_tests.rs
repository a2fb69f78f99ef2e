//! Tests for async launch/await

use super::helpers::{event_names, permissive, Runner};
use crate::interpreter::errors;
use crate::interpreter::{ErrorKind, RunRequest, StaticToolRunner, TraceEvent, Val};

const FUNCTIONS: &str = r#"[
    {"name": "square", "params": ["n"], "body": [
        {"t": "Return", "value": {"t": "Binary", "op": "mul",
            "left": {"t": "Var", "name": "n"}, "right": {"t": "Var", "name": "n"}}}
    ]}
]"#;

fn launch(name: &str, n: u32) -> String {
    format!(
        r#"{{"t": "AsyncLaunch", "name": "{name}", "line": {n}, "column": 1,
            "call": {{"t": "CallFunction", "name": "square", "args": [{{"t": "Lit", "v": {n}}}]}}}}"#
    )
}

fn await_into(name: &str, target: &str) -> String {
    format!(r#"{{"t": "AsyncAwait", "name": "{name}", "target": "{target}"}}"#)
}

fn two_tasks(awaits: [String; 2]) -> String {
    format!(
        r#"{{
        "functions": {FUNCTIONS},
        "flows": [{{"name": "main", "body": [
            {},
            {},
            {},
            {},
            {{"t": "Set", "target": {{"t": "State", "path": ["total"]}},
              "value": {{"t": "Binary", "op": "add",
                  "left": {{"t": "Var", "name": "ra"}}, "right": {{"t": "Var", "name": "rb"}}}}}}
        ]}}]
    }}"#,
        launch("a", 2),
        launch("b", 3),
        awaits[0],
        awaits[1]
    )
}

#[test]
fn test_await_order_does_not_change_state_or_trace() {
    let forward = two_tasks([await_into("a", "ra"), await_into("b", "rb")]);
    let reverse = two_tasks([await_into("b", "rb"), await_into("a", "ra")]);

    let forward = Runner::new(&forward, permissive()).run(RunRequest::new("main")).ok();
    let reverse = Runner::new(&reverse, permissive()).run(RunRequest::new("main")).ok();

    assert_eq!(
        forward.state.get_path(&["total".to_string()]),
        Some(&Val::Num(13.0))
    );
    assert_eq!(forward.state, reverse.state);
    assert_eq!(forward.traces, reverse.traces);
    assert_eq!(forward.trace_digest, reverse.trace_digest);

    let launched: Vec<(&str, &str)> = forward
        .traces
        .iter()
        .filter_map(|e| match e {
            TraceEvent::AsyncTaskLaunched { task_id, status, .. } => Some((task_id.as_str(), status.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(
        launched,
        vec![("main:async:1:a", "running"), ("main:async:2:b", "running")]
    );
}

#[test]
fn test_launch_rejects_non_call_targets() {
    let program = r#"{"flows": [{"name": "main", "body": [
        {"t": "AsyncLaunch", "name": "x", "call": {"t": "Lit", "v": 1}}
    ]}]}"#;
    let failure = Runner::new(program, permissive()).run(RunRequest::new("main")).err();
    assert_eq!(failure.error.kind, ErrorKind::AsyncTask);
    assert_eq!(failure.error.reason_code(), errors::ASYNC_TARGET_INVALID);
}

#[test]
fn test_await_unknown_task() {
    let program = r#"{"flows": [{"name": "main", "body": [
        {"t": "Let", "name": "x", "value": {"t": "Lit", "v": 1}},
        {"t": "AsyncAwait", "name": "x"}
    ]}]}"#;
    let failure = Runner::new(program, permissive()).run(RunRequest::new("main")).err();
    assert_eq!(failure.error.reason_code(), errors::ASYNC_TASK_UNKNOWN);
}

#[test]
fn test_failed_task_raises_on_await_not_on_launch() {
    let program = r#"{
        "tools": [{"name": "flaky"}],
        "flows": [{"name": "main", "body": [
            {"t": "AsyncLaunch", "name": "job", "line": 2, "column": 1,
             "call": {"t": "CallTool", "name": "flaky", "args": []}},
            {"t": "Set", "target": {"t": "State", "path": ["launched"]}, "value": {"t": "Lit", "v": true}},
            {"t": "AsyncAwait", "name": "job", "line": 4, "column": 1}
        ]}]
    }"#;
    let failure = Runner::new(program, permissive())
        .tools(StaticToolRunner::new().fail("flaky", "timeout"))
        .run(RunRequest::new("main"))
        .err();

    assert_eq!(failure.error.kind, ErrorKind::AsyncTask);
    assert_eq!(failure.error.reason_code(), errors::ASYNC_TASK_FAILED);
    assert!(failure.error.message.contains("timeout"));
    assert_eq!(
        event_names(&failure.traces),
        vec![
            "boundary_started",
            "tool_call",
            "boundary_finished",
            "async_task_launched",
            "runtime_error"
        ]
    );
    // Set ran between launch and await
    assert_eq!(failure.steps.iter().filter(|s| s.kind == "set").count(), 1);
}

#[test]
fn test_capability_denial_escalates_from_launch() {
    let program = r#"{
        "tools": [{"name": "fetch", "capabilities": ["network"]}],
        "flows": [{"name": "main", "body": [
            {"t": "AsyncLaunch", "name": "page", "call": {"t": "CallTool", "name": "fetch",
                "args": [{"key": "url", "value": {"t": "Lit", "v": "https://example.com"}}]}}
        ]}]
    }"#;
    let mut config = permissive();
    config.capabilities.policy.insert("no_network".to_string(), true);
    let outcome = Runner::new(program, config).run(RunRequest::new("main"));
    assert!(outcome.tools.calls.is_empty());
    let failure = outcome.err();
    assert_eq!(failure.error.kind, ErrorKind::CapabilityViolation);
    assert!(failure
        .traces
        .iter()
        .all(|e| !matches!(e, TraceEvent::AsyncTaskLaunched { .. })));
}

#[test]
fn test_launch_into_a_constant_fails_before_calling() {
    let program = r#"{
        "tools": [{"name": "fetch"}],
        "flows": [{"name": "main", "body": [
            {"t": "Let", "name": "job", "constant": true, "value": {"t": "Lit", "v": 1}},
            {"t": "AsyncLaunch", "name": "job", "line": 3, "column": 1,
             "call": {"t": "CallTool", "name": "fetch", "args": []}}
        ]}]
    }"#;
    let outcome = Runner::new(program, permissive()).run(RunRequest::new("main"));
    assert!(outcome.tools.calls.is_empty());
    let failure = outcome.err();
    assert_eq!(failure.error.kind, ErrorKind::Reassignment);
    assert_eq!(failure.error.reason_code(), errors::CONSTANT_REASSIGNMENT);
    assert_eq!(failure.error.location.map(|l| l.line), Some(3));
    assert_eq!(event_names(&failure.traces), vec!["runtime_error"]);
}

#[test]
fn test_task_runs_against_a_snapshot() {
    let program = r#"{
        "flows": [
            {"name": "bump", "body": [
                {"t": "Set", "target": {"t": "State", "path": ["bumped"]}, "value": {"t": "Lit", "v": true}},
                {"t": "Return", "value": {"t": "Lit", "v": "done"}}
            ]},
            {"name": "main", "body": [
                {"t": "AsyncLaunch", "name": "job", "call": {"t": "CallFlow", "name": "bump", "args": []}},
                {"t": "AsyncAwait", "name": "job", "target": "out"},
                {"t": "Return", "value": {"t": "Var", "name": "out"}}
            ]}
        ]
    }"#;
    let result = Runner::new(program, permissive()).run(RunRequest::new("main")).ok();
    assert_eq!(result.last_value, Val::str("done"));
    assert_eq!(result.state.get_path(&["bumped".to_string()]), None);
}
