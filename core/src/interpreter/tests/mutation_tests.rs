//! Tests for mutation policy gating

use super::helpers::{event_names, obj, permissive, Runner};
use crate::config::EngineConfig;
use crate::interpreter::errors;
use crate::interpreter::types::{FieldType, RecordSchema};
use crate::interpreter::{ErrorKind, RunRequest, TraceEvent, Val};
use crate::storage::{MemoryStore, PredicatePlan, RecordScope, Storage};

const ITEM_RECORD: &str = r#"{"name": "Item", "fields": [
    {"name": "name", "type": "text"},
    {"name": "count", "type": "int"}
]}"#;

/// Flow `seed` writing through every mutation statement, guarded by `requires`
fn crud_program(requires: &str, audited: bool) -> String {
    format!(
        r#"{{
        "records": [{ITEM_RECORD}],
        "flows": [{{
            "name": "seed",
            "requires": {requires},
            "audited": {audited},
            "body": [
                {{"t": "Create", "record": "Item", "line": 2, "column": 3, "target": "a",
                  "values": {{"t": "Map", "entries": [
                    {{"key": "name", "value": {{"t": "Lit", "v": "alpha"}}}},
                    {{"key": "count", "value": {{"t": "Lit", "v": 2}}}}
                  ]}}}},
                {{"t": "Update", "record": "Item", "line": 3, "column": 3,
                  "predicate": {{"t": "Compare", "field": "name", "op": "eq", "value": {{"t": "Lit", "v": "alpha"}}}},
                  "changes": [{{"field": "count", "value": {{"t": "Lit", "v": 3}}}}]}},
                {{"t": "Save", "record": "Item", "line": 4, "column": 3,
                  "values": {{"t": "Map", "entries": [
                    {{"key": "id", "value": {{"t": "Lit", "v": 1}}}},
                    {{"key": "name", "value": {{"t": "Lit", "v": "alpha"}}}},
                    {{"key": "count", "value": {{"t": "Lit", "v": 4}}}}
                  ]}}}},
                {{"t": "Delete", "record": "Item", "line": 5, "column": 3,
                  "predicate": {{"t": "Compare", "field": "count", "op": "gt", "value": {{"t": "Lit", "v": 10}}}}}}
            ]
        }}]
    }}"#
    )
}

const ADMIN_RULE: &str = r#"{"t": "Compare", "op": "eq",
    "left": {"t": "Attr", "base": "identity", "path": ["role"]},
    "right": {"t": "Lit", "v": "admin"}}"#;

/// `identity.role == "admin" and mutation.record == "Item"`
const ADMIN_MUTATION_RULE: &str = r#"{"t": "Binary", "op": "and",
    "left": {"t": "Compare", "op": "eq",
        "left": {"t": "Attr", "base": "identity", "path": ["role"]},
        "right": {"t": "Lit", "v": "admin"}},
    "right": {"t": "Compare", "op": "eq",
        "left": {"t": "Attr", "base": "mutation", "path": ["record"]},
        "right": {"t": "Lit", "v": "Item"}}}"#;

fn as_role(role: &str) -> RunRequest {
    RunRequest::new("seed").identity(obj(&[("role", Val::str(role))]))
}

#[test]
fn test_every_mutation_has_one_decision_before_its_write() {
    let result = Runner::new(&crud_program(ADMIN_MUTATION_RULE, false), EngineConfig::default())
        .run(as_role("admin"))
        .ok();

    let per_write = ["capability_check", "mutation_allowed", "record_write"];
    let expected: Vec<&str> = per_write.iter().cycle().take(12).copied().collect();
    assert_eq!(event_names(&result.traces), expected);

    let step_ids: Vec<&str> = result
        .traces
        .iter()
        .filter_map(|e| match e {
            TraceEvent::MutationAllowed { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        step_ids,
        vec!["seed:create:1", "seed:update:2", "seed:save:3", "seed:delete:4"]
    );

    let verbs: Vec<&str> = result
        .traces
        .iter()
        .filter_map(|e| match e {
            TraceEvent::RecordWrite { verb, .. } => Some(verb.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(verbs, vec!["created", "updated", "saved", "deleted"]);
}

#[test]
fn test_denied_mutation_never_reaches_storage() {
    let mut store = MemoryStore::new();
    let failure = Runner::new(&crud_program(ADMIN_MUTATION_RULE, false), EngineConfig::default())
        .run_on(&mut store, as_role("guest"))
        .err();

    assert_eq!(failure.error.kind, ErrorKind::PolicyDenied);
    let details = &failure.error.details;
    assert_eq!(details.category, "policy");
    assert_eq!(details.reason_code, errors::ACCESS_DENIED);
    assert_eq!(details.flow_name.as_deref(), Some("seed"));
    assert_eq!(details.record.as_deref(), Some("Item"));
    assert_eq!(details.action.as_deref(), Some("create"));
    assert_eq!(details.step_id.as_deref(), Some("seed:create:1"));
    assert_eq!(failure.error.location.map(|l| l.line), Some(2));

    assert_eq!(
        event_names(&failure.traces),
        vec!["capability_check", "mutation_blocked", "runtime_error"]
    );

    let schema = RecordSchema::new("Item", vec![("name", FieldType::Text), ("count", FieldType::Int)]);
    let rows = store
        .find(&schema, &PredicatePlan::all(), &RecordScope::default())
        .unwrap();
    assert!(rows.is_empty());
}

#[test]
fn test_missing_rule_blocks_writes_when_required() {
    let failure = Runner::new(&crud_program("null", false), EngineConfig::default())
        .run(as_role("admin"))
        .err();
    assert_eq!(failure.error.reason_code(), errors::POLICY_MISSING);
    assert!(failure.error.fix_hint.is_some());

    // Same program passes when rules are optional
    Runner::new(&crud_program("null", false), permissive())
        .run(as_role("admin"))
        .ok();
}

#[test]
fn test_audit_required_checks_the_audited_flag() {
    let mut config = EngineConfig::default();
    config.mutation.audit_required = true;
    let rule = r#"{"t": "Lit", "v": true}"#;

    let failure = Runner::new(&crud_program(rule, false), config.clone())
        .run(as_role("admin"))
        .err();
    assert_eq!(failure.error.reason_code(), errors::AUDIT_REQUIRED);

    Runner::new(&crud_program(rule, true), config).run(as_role("admin")).ok();
}

#[test]
fn test_non_boolean_rule_is_invalid() {
    let rule = r#"{"t": "Attr", "base": "mutation", "path": ["action"]}"#;
    let failure = Runner::new(&crud_program(rule, false), EngineConfig::default())
        .run(as_role("admin"))
        .err();
    assert_eq!(failure.error.reason_code(), errors::POLICY_INVALID);
    assert_eq!(failure.error.kind, ErrorKind::PolicyDenied);
}

#[test]
fn test_no_mutation_guarantee_disables_writes() {
    let mut config = permissive();
    config
        .capabilities
        .policy
        .insert("no_mutation".to_string(), true);

    let failure = Runner::new(&crud_program("null", false), config)
        .run(as_role("admin"))
        .err();
    assert_eq!(failure.error.reason_code(), errors::MUTATION_DISABLED);
    match &failure.traces[0] {
        TraceEvent::CapabilityCheck {
            capability, allowed, ..
        } => {
            assert_eq!(capability, "mutation");
            assert!(!allowed);
        }
        other => panic!("expected capability_check, got {:?}", other),
    }
}

#[test]
fn test_flow_rule_without_mutation_is_enforced_at_start() {
    let failure = Runner::new(&crud_program(ADMIN_RULE, false), EngineConfig::default())
        .run(as_role("guest"))
        .err();
    assert_eq!(failure.error.reason_code(), errors::ACCESS_DENIED);
    assert_eq!(event_names(&failure.traces), vec!["runtime_error"]);
    let kinds: Vec<&str> = failure.steps.iter().map(|s| s.kind.as_str()).collect();
    assert_eq!(kinds, vec!["flow_start", "error", "flow_end"]);

    Runner::new(&crud_program(ADMIN_RULE, false), EngineConfig::default())
        .run(as_role("admin"))
        .ok();
}
