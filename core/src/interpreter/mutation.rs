//! Mutation policy engine
//!
//! A capability check specialized for record writes. The decision is made
//! and traced before the storage call; a denial raises `PolicyDenied` and the
//! storage call never happens.

use super::capability::{self, Subject};
use super::context::ExecutionContext;
use super::errors::{self, EngineError, ErrorKind};
use super::expressions::eval;
use super::trace::TraceEvent;
use super::types::{Effect, Val};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
    Save,
}

impl MutationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
            MutationAction::Save => "save",
        }
    }

    /// Verb recorded on the `record_write` event after a successful write
    pub fn verb(self) -> &'static str {
        match self {
            MutationAction::Create => "created",
            MutationAction::Update => "updated",
            MutationAction::Delete => "deleted",
            MutationAction::Save => "saved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationDecision {
    pub allowed: bool,
    pub reason_code: Option<String>,
    pub message: String,
    pub fix_hint: Option<String>,
    pub record: String,
    pub action: MutationAction,
    pub step_id: String,
}

impl MutationDecision {
    fn allow(action: MutationAction, record: &str, step_id: &str) -> Self {
        Self {
            allowed: true,
            reason_code: None,
            message: format!("{} on '{}' allowed", action.as_str(), record),
            fix_hint: None,
            record: record.to_string(),
            action,
            step_id: step_id.to_string(),
        }
    }

    fn deny(action: MutationAction, record: &str, step_id: &str, reason: &str, message: String, hint: String) -> Self {
        Self {
            allowed: false,
            reason_code: Some(reason.to_string()),
            message,
            fix_hint: Some(hint),
            record: record.to_string(),
            action,
            step_id: step_id.to_string(),
        }
    }
}

/// Decide whether the current flow may perform `action` on `record`
pub fn evaluate(
    ctx: &mut ExecutionContext<'_>,
    action: MutationAction,
    record: &str,
    step_id: &str,
) -> MutationDecision {
    let flow_name = ctx.flow_name.clone();

    let gate = capability::check(ctx, Effect::Mutation, Subject::ENGINE, Some(record), step_id);
    if !gate.allowed {
        return MutationDecision::deny(
            action,
            record,
            step_id,
            errors::MUTATION_DISABLED,
            format!("Record mutation is disabled: {}", gate.message),
            "Remove the no_mutation guarantee or move this write out of the app.".to_string(),
        );
    }

    let flow = ctx.current_flow();
    let requires = flow.and_then(|f| f.requires.as_ref());
    let audited = flow.map(|f| f.audited).unwrap_or(false);
    let config = ctx.config;
    let policy = &config.mutation;

    let Some(requires) = requires else {
        if policy.require_rule {
            return MutationDecision::deny(
                action,
                record,
                step_id,
                errors::POLICY_MISSING,
                format!(
                    "Flow '{}' cannot {} '{}' without a requires rule",
                    flow_name,
                    action.as_str(),
                    record
                ),
                format!("Add a requires rule to flow '{}'.", flow_name),
            );
        }
        return audit_or_allow(audited, policy.audit_required, action, record, step_id, &flow_name);
    };

    if policy.audit_required && !audited {
        return audit_or_allow(audited, true, action, record, step_id, &flow_name);
    }

    // Temporary `mutation` binding visible only to the rule
    let mutation = Val::Obj(BTreeMap::from([
        ("action".to_string(), Val::str(action.as_str())),
        ("record".to_string(), Val::str(record)),
    ]));
    let previous = ctx.locals.insert("mutation".to_string(), mutation);
    let outcome = eval(ctx, requires);
    match previous {
        Some(value) => ctx.locals.insert("mutation".to_string(), value),
        None => ctx.locals.remove("mutation"),
    };

    match outcome {
        Ok(Val::Bool(true)) => MutationDecision::allow(action, record, step_id),
        Ok(Val::Bool(false)) => MutationDecision::deny(
            action,
            record,
            step_id,
            errors::ACCESS_DENIED,
            format!(
                "Requires rule of flow '{}' denied {} on '{}'",
                flow_name,
                action.as_str(),
                record
            ),
            "Run the flow with an identity that satisfies its requires rule.".to_string(),
        ),
        Ok(other) => MutationDecision::deny(
            action,
            record,
            step_id,
            errors::POLICY_INVALID,
            format!(
                "Requires rule of flow '{}' produced {} instead of a boolean",
                flow_name,
                other.kind()
            ),
            "Make the requires rule a boolean expression.".to_string(),
        ),
        Err(err) => MutationDecision::deny(
            action,
            record,
            step_id,
            errors::POLICY_INVALID,
            format!("Requires rule of flow '{}' could not be evaluated: {}", flow_name, err),
            "Fix the requires rule so it evaluates without errors.".to_string(),
        ),
    }
}

fn audit_or_allow(
    audited: bool,
    audit_required: bool,
    action: MutationAction,
    record: &str,
    step_id: &str,
    flow_name: &str,
) -> MutationDecision {
    if audit_required && !audited {
        return MutationDecision::deny(
            action,
            record,
            step_id,
            errors::AUDIT_REQUIRED,
            format!(
                "Flow '{}' must be audited to {} '{}'",
                flow_name,
                action.as_str(),
                record
            ),
            format!("Mark flow '{}' as audited.", flow_name),
        );
    }
    MutationDecision::allow(action, record, step_id)
}

/// Evaluate, trace, and raise `PolicyDenied` on denial
pub fn authorize(
    ctx: &mut ExecutionContext<'_>,
    action: MutationAction,
    record: &str,
    step_id: &str,
) -> Result<MutationDecision, EngineError> {
    let decision = evaluate(ctx, action, record, step_id);
    let flow_name = ctx.flow_name.clone();

    if decision.allowed {
        debug!(flow = %flow_name, record, action = action.as_str(), "Mutation allowed");
        ctx.trace(TraceEvent::MutationAllowed {
            step_id: step_id.to_string(),
            flow_name,
            record: record.to_string(),
            action: action.as_str().to_string(),
        });
        return Ok(decision);
    }

    let reason = decision.reason_code.clone().unwrap_or_default();
    let hint = decision.fix_hint.clone().unwrap_or_default();
    warn!(flow = %flow_name, record, action = action.as_str(), reason = %reason, "Mutation blocked");
    ctx.trace(TraceEvent::MutationBlocked {
        step_id: step_id.to_string(),
        flow_name: flow_name.clone(),
        record: record.to_string(),
        action: action.as_str().to_string(),
        reason_code: reason.clone(),
        message: decision.message.clone(),
        fix_hint: hint.clone(),
    });
    Err(EngineError::new(ErrorKind::PolicyDenied, &reason, decision.message)
        .with_flow(&flow_name)
        .with_record(record)
        .with_action(action.as_str())
        .with_step(step_id)
        .with_hint(hint))
}
