//! Tests for match, try/catch and repeat while

use super::helpers::{permissive, Runner};
use crate::interpreter::errors;
use crate::interpreter::{ErrorKind, ExecutionStep, RunRequest, StaticToolRunner, Val};

fn decision_steps(steps: &[ExecutionStep]) -> Vec<&str> {
    steps
        .iter()
        .map(|s| s.kind.as_str())
        .filter(|k| matches!(*k, "decision_try" | "catch_taken" | "catch_skipped"))
        .collect()
}

/* ===================== Match ===================== */

fn match_program(subject: &str) -> String {
    format!(
        r#"{{"flows": [{{"name": "main", "body": [
        {{"t": "Match", "subject": {{"t": "Lit", "v": {subject}}},
          "cases": [
            {{"pattern": {{"t": "Lit", "v": "draft"}}, "body": [{{"t": "Return", "value": {{"t": "Lit", "v": 1}}}}]}},
            {{"pattern": {{"t": "Lit", "v": "sent"}}, "body": [{{"t": "Return", "value": {{"t": "Lit", "v": 2}}}}]}},
            {{"pattern": {{"t": "Lit", "v": "sent"}}, "body": [{{"t": "Return", "value": {{"t": "Lit", "v": 3}}}}]}}
          ],
          "otherwise": [{{"t": "Return", "value": {{"t": "Lit", "v": 0}}}}]}}
    ]}}]}}"#
    )
}

#[test]
fn test_match_runs_the_first_equal_case() {
    let result = Runner::new(&match_program(r#""sent""#), permissive())
        .run(RunRequest::new("main"))
        .ok();
    assert_eq!(result.last_value, Val::Num(2.0));
}

#[test]
fn test_match_falls_back_to_otherwise() {
    let result = Runner::new(&match_program(r#""archived""#), permissive())
        .run(RunRequest::new("main"))
        .ok();
    assert_eq!(result.last_value, Val::Num(0.0));

    // No loose equality between kinds
    let result = Runner::new(&match_program("1"), permissive())
        .run(RunRequest::new("main"))
        .ok();
    assert_eq!(result.last_value, Val::Num(0.0));
}

/* ===================== Try / Catch ===================== */

const GUARDED: &str = r#"{
    "tools": [{"name": "flaky"}, {"name": "fetch", "capabilities": ["network"]}],
    "flows": [
        {"name": "recover", "body": [
            {"t": "TryCatch", "line": 2, "column": 1, "catch_var": "problem",
             "try_body": [
                {"t": "Evaluate", "line": 3, "column": 5, "expr": {"t": "CallTool", "name": "flaky", "args": []}},
                {"t": "Return", "value": {"t": "Lit", "v": "unreachable"}}
             ],
             "catch_body": [
                {"t": "Set", "target": {"t": "State", "path": ["last_error"]},
                 "value": {"t": "Attr", "base": "problem", "path": ["reason"]}}
             ]},
            {"t": "Return", "value": {"t": "Var", "name": "problem"}}
        ]},
        {"name": "no_error", "body": [
            {"t": "TryCatch", "catch_var": "problem",
             "try_body": [{"t": "Return", "value": {"t": "Lit", "v": "fine"}}],
             "catch_body": [{"t": "Return", "value": {"t": "Lit", "v": "caught"}}]}
        ]},
        {"name": "denied", "body": [
            {"t": "TryCatch", "catch_var": "problem",
             "try_body": [{"t": "Evaluate", "expr": {"t": "CallTool", "name": "fetch", "args": []}}],
             "catch_body": [{"t": "Return", "value": {"t": "Lit", "v": "caught"}}]}
        ]}
    ]
}"#;

fn guarded() -> Runner {
    Runner::new(GUARDED, permissive()).tools(StaticToolRunner::new().fail("flaky", "connection reset"))
}

#[test]
fn test_catch_binds_the_error_and_runs() {
    let result = guarded().run(RunRequest::new("recover")).ok();

    let problem = result.last_value.as_obj().expect("caught error is an object");
    assert_eq!(problem.get("kind"), Some(&Val::str("runtime")));
    assert_eq!(problem.get("reason"), Some(&Val::str(errors::TOOL_FAILED)));
    assert_eq!(problem.get("line"), Some(&Val::Num(3.0)));
    assert!(problem
        .get("message")
        .and_then(Val::as_str)
        .unwrap_or_default()
        .contains("connection reset"));
    assert_eq!(
        result.state.get_path(&["last_error".to_string()]),
        Some(&Val::str(errors::TOOL_FAILED))
    );
    assert_eq!(decision_steps(&result.steps), vec!["decision_try", "catch_taken"]);
}

#[test]
fn test_catch_is_skipped_without_an_error() {
    let result = guarded().run(RunRequest::new("no_error")).ok();
    assert_eq!(result.last_value, Val::str("fine"));
    assert_eq!(decision_steps(&result.steps), vec!["decision_try", "catch_skipped"]);
}

#[test]
fn test_capability_denial_is_not_caught() {
    let mut config = permissive();
    config.capabilities.policy.insert("no_network".to_string(), true);
    let outcome = Runner::new(GUARDED, config).run(RunRequest::new("denied"));
    assert!(outcome.tools.calls.is_empty());
    let failure = outcome.err();

    assert_eq!(failure.error.kind, ErrorKind::CapabilityViolation);
    assert_eq!(decision_steps(&failure.steps), vec!["decision_try"]);
}

/* ===================== Repeat While ===================== */

fn countdown(limit: &str) -> String {
    format!(
        r#"{{"flows": [{{"name": "main", "body": [
        {{"t": "Let", "name": "n", "value": {{"t": "Lit", "v": 3}}}},
        {{"t": "Let", "name": "ticks", "value": {{"t": "Lit", "v": 0}}}},
        {{"t": "RepeatWhile", "line": 3, "column": 1, "limit": {limit},
          "test": {{"t": "Compare", "op": "gt", "left": {{"t": "Var", "name": "n"}}, "right": {{"t": "Lit", "v": 0}}}},
          "body": [
            {{"t": "Set", "target": {{"t": "Var", "name": "n"}}, "value": {{"t": "Binary", "op": "sub",
                "left": {{"t": "Var", "name": "n"}}, "right": {{"t": "Lit", "v": 1}}}}}},
            {{"t": "Set", "target": {{"t": "Var", "name": "ticks"}}, "value": {{"t": "Binary", "op": "add",
                "left": {{"t": "Var", "name": "ticks"}}, "right": {{"t": "Lit", "v": 1}}}}}}
          ]}},
        {{"t": "Return", "value": {{"t": "Var", "name": "ticks"}}}}
    ]}}]}}"#
    )
}

#[test]
fn test_repeat_while_stops_when_condition_turns_false() {
    let result = Runner::new(&countdown("null"), permissive())
        .run(RunRequest::new("main"))
        .ok();
    assert_eq!(result.last_value, Val::Num(3.0));

    // Exactly enough iterations is within the limit
    let result = Runner::new(&countdown("3"), permissive())
        .run(RunRequest::new("main"))
        .ok();
    assert_eq!(result.last_value, Val::Num(3.0));
}

#[test]
fn test_repeat_while_limit_is_enforced() {
    let failure = Runner::new(&countdown("2"), permissive())
        .run(RunRequest::new("main"))
        .err();
    assert_eq!(failure.error.kind, ErrorKind::Runtime);
    assert_eq!(failure.error.reason_code(), errors::LIMIT_EXCEEDED);
    assert_eq!(failure.error.location.map(|l| l.line), Some(3));

    let mut config = permissive();
    config.limits.max_loop_iterations = 1;
    let failure = Runner::new(&countdown("null"), config).run(RunRequest::new("main")).err();
    assert_eq!(failure.error.reason_code(), errors::LIMIT_EXCEEDED);
}
