//! Parallel blocks
//!
//! Branches run one after another in declaration order, each against its own
//! snapshot of the bindings with `parallel_mode` on. The merge step then
//! selects or combines branch outcomes according to the block's policy.

use super::context::ExecutionContext;
use super::errors::{self, EngineError, ErrorKind};
use super::statements::{exec_block, Control};
use super::trace::TraceEvent;
use super::types::{Branch, MergePolicy, MergeSpec, Val};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BranchOutcome {
    pub name: String,
    pub result: Result<Val, EngineError>,
}

impl BranchOutcome {
    fn ok(&self) -> Option<&Val> {
        self.result.as_ref().ok()
    }
}

#[derive(Debug, Clone)]
pub struct MergeDecision {
    pub value: Result<Val, EngineError>,
    pub selected: Option<String>,
    pub failed: Vec<String>,
    pub reason: String,
}

/* ===================== Execution ===================== */

pub fn run_parallel(
    ctx: &mut ExecutionContext<'_>,
    branches: &[Branch],
    merge: Option<&MergeSpec>,
) -> Result<Val, EngineError> {
    let max = ctx.config.limits.max_parallel_branches;
    if branches.len() > max {
        return Err(EngineError::runtime(
            errors::LIMIT_EXCEEDED,
            format!("Parallel block declares {} branches; the limit is {}", branches.len(), max),
        ));
    }

    let policy = merge.map(|m| m.policy).unwrap_or(MergePolicy::AllOk);
    let precedence = merge.map(|m| m.precedence.clone()).unwrap_or_default();
    check_precedence(branches, &precedence)?;
    let block = ctx.step_id("parallel");

    let mut outcomes = Vec::with_capacity(branches.len());
    for branch in branches {
        let outcome = run_branch(ctx, &block, branch)?;
        outcomes.push(outcome);
    }

    ctx.trace(TraceEvent::OrchestrationMergeStarted {
        block: block.clone(),
        policy: policy.as_str().to_string(),
        branches: outcomes.iter().map(|o| o.name.clone()).collect(),
    });
    let decision = merge_outcomes(policy, &precedence, &outcomes);
    debug!(block = %block, policy = policy.as_str(), selected = ?decision.selected, "Parallel merge");
    ctx.trace(TraceEvent::OrchestrationMergeFinished {
        block,
        policy: policy.as_str().to_string(),
        selected: decision.selected.clone(),
        failed: decision.failed.clone(),
        precedence,
        reason: decision.reason.clone(),
    });
    decision.value
}

/// Every precedence entry names a declared branch, at most once
fn check_precedence(branches: &[Branch], precedence: &[String]) -> Result<(), EngineError> {
    let mut seen = BTreeSet::new();
    for name in precedence {
        if !branches.iter().any(|b| &b.name == name) {
            return Err(EngineError::runtime(
                errors::INVALID_PRECEDENCE,
                format!("Merge precedence names unknown branch '{}'", name),
            )
            .with_hint("List only branch names declared in this parallel block."));
        }
        if !seen.insert(name.as_str()) {
            return Err(EngineError::runtime(
                errors::INVALID_PRECEDENCE,
                format!("Merge precedence lists branch '{}' more than once", name),
            ));
        }
    }
    Ok(())
}

fn run_branch(ctx: &mut ExecutionContext<'_>, block: &str, branch: &Branch) -> Result<BranchOutcome, EngineError> {
    ctx.trace(TraceEvent::OrchestrationBranchStarted {
        block: block.to_string(),
        branch: branch.name.clone(),
    });

    let saved = ctx.snapshot();
    let was_parallel = std::mem::replace(&mut ctx.parallel_mode, true);
    let outer_task = ctx.parallel_task.replace(branch.name.clone());
    ctx.last_value = Val::Null;

    let result = exec_block(ctx, &branch.body).map(|control| match control {
        Control::Return(value) => value,
        Control::Continue => std::mem::take(&mut ctx.last_value),
    });

    ctx.parallel_mode = was_parallel;
    ctx.parallel_task = outer_task;
    ctx.restore(saved);

    let (status, error) = match &result {
        Ok(_) => ("completed", None),
        Err(err) => ("failed", Some(err.message.clone())),
    };
    ctx.trace(TraceEvent::OrchestrationBranchFinished {
        block: block.to_string(),
        branch: branch.name.clone(),
        status: status.to_string(),
        error,
    });

    match result {
        Err(err) if err.escalates() => Err(err),
        result => Ok(BranchOutcome {
            name: branch.name.clone(),
            result,
        }),
    }
}

/* ===================== Merge Policies ===================== */

fn merge_error(reason: &str, message: String) -> EngineError {
    EngineError::new(ErrorKind::MergeConflict, reason, message)
}

/// Combine branch outcomes; `outcomes` are in declaration order
pub fn merge_outcomes(policy: MergePolicy, precedence: &[String], outcomes: &[BranchOutcome]) -> MergeDecision {
    let failed: Vec<String> = outcomes
        .iter()
        .filter(|o| o.result.is_err())
        .map(|o| o.name.clone())
        .collect();
    let successes: Vec<(&str, &Val)> = outcomes
        .iter()
        .filter_map(|o| o.ok().map(|v| (o.name.as_str(), v)))
        .collect();

    let none_succeeded = || MergeDecision {
        value: Err(merge_error(
            errors::NO_SUCCESSFUL_BRANCH,
            format!("No branch succeeded; failed: {}", failed.join(", ")),
        )),
        selected: None,
        failed: failed.clone(),
        reason: "no successful branch".to_string(),
    };

    match policy {
        MergePolicy::Conflict => {
            let Some((first_name, first)) = successes.first().copied() else {
                return none_succeeded();
            };
            if let Some((other, _)) = successes.iter().find(|(_, v)| *v != first) {
                let message = format!("Branches '{}' and '{}' produced different results", first_name, other);
                return MergeDecision {
                    value: Err(merge_error(errors::MERGE_CONFLICT, message.clone())),
                    selected: None,
                    failed,
                    reason: message,
                };
            }
            MergeDecision {
                value: Ok(first.clone()),
                selected: Some(first_name.to_string()),
                reason: format!("{} successful branches agree", successes.len()),
                failed,
            }
        }

        MergePolicy::Precedence => {
            let ordered = precedence
                .iter()
                .map(String::as_str)
                .chain(outcomes.iter().map(|o| o.name.as_str()));
            let picked = ordered
                .filter_map(|name| successes.iter().find(|(n, _)| *n == name))
                .next();
            match picked {
                Some((name, value)) => MergeDecision {
                    value: Ok((*value).clone()),
                    selected: Some(name.to_string()),
                    reason: format!("'{}' is the highest-precedence successful branch", name),
                    failed,
                },
                None => none_succeeded(),
            }
        }

        MergePolicy::Override => {
            let Some((last_name, last)) = successes.last().copied() else {
                return none_succeeded();
            };
            let all_objects = successes.iter().all(|(_, v)| matches!(v, Val::Obj(_)));
            if !all_objects {
                return MergeDecision {
                    value: Ok(last.clone()),
                    selected: Some(last_name.to_string()),
                    reason: format!("last successful branch '{}' overrides earlier results", last_name),
                    failed,
                };
            }
            let mut merged = BTreeMap::new();
            for (_, value) in &successes {
                if let Val::Obj(map) = value {
                    merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            MergeDecision {
                value: Ok(Val::Obj(merged)),
                selected: Some(last_name.to_string()),
                reason: format!("merged {} objects, later branches override earlier keys", successes.len()),
                failed,
            }
        }

        MergePolicy::FirstOk => match successes.first() {
            Some((name, value)) => MergeDecision {
                value: Ok((*value).clone()),
                selected: Some(name.to_string()),
                reason: format!("'{}' is the first successful branch", name),
                failed,
            },
            None => none_succeeded(),
        },

        MergePolicy::AllOk => {
            if !failed.is_empty() {
                let message = format!("Branches failed: {}", failed.join(", "));
                return MergeDecision {
                    value: Err(merge_error(errors::BRANCH_FAILED, message.clone())),
                    selected: None,
                    failed,
                    reason: message,
                };
            }
            let combined = successes
                .iter()
                .map(|(name, value)| (name.to_string(), (*value).clone()))
                .collect();
            MergeDecision {
                value: Ok(Val::Obj(combined)),
                selected: None,
                reason: format!("all {} branches succeeded", successes.len()),
                failed,
            }
        }

        MergePolicy::Collect => {
            let collected = outcomes
                .iter()
                .map(|o| {
                    let entry = match &o.result {
                        Ok(value) => BTreeMap::from([
                            ("status".to_string(), Val::str("completed")),
                            ("value".to_string(), value.clone()),
                        ]),
                        Err(err) => BTreeMap::from([
                            ("status".to_string(), Val::str("failed")),
                            ("error".to_string(), Val::str(err.message.clone())),
                        ]),
                    };
                    (o.name.clone(), Val::Obj(entry))
                })
                .collect();
            MergeDecision {
                value: Ok(Val::Obj(collected)),
                selected: None,
                reason: format!("collected {} branches, {} failed", outcomes.len(), failed.len()),
                failed,
            }
        }
    }
}
