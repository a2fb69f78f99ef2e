//! Calls: tools, AI profiles, flows, pipelines and pure functions
//!
//! Tools and AI calls pass through the capability gate and are bracketed by
//! boundary events. Flow and pipeline calls are bracketed by their own
//! started/finished events. Pure functions run with an empty local scope and
//! may not touch records, tools or AI.

use super::capability::{self, Subject};
use super::context::ExecutionContext;
use super::errors::{self, EngineError};
use super::statements::{exec_block, Control};
use super::trace::TraceEvent;
use super::types::{Effect, Val};
use std::collections::BTreeMap;
use tracing::debug;

fn effect_in_function(ctx: &ExecutionContext<'_>, what: &str) -> EngineError {
    let function = ctx.call_stack.last().cloned().unwrap_or_default();
    EngineError::illegal_effect(
        errors::EFFECT_IN_FUNCTION,
        format!("Function '{}' is pure and cannot {}", function, what),
    )
    .with_hint("Move the call into a flow and pass its result to the function.")
}

/// Path or URL argument a filesystem/network effect is aimed at
fn effect_target(effect: Effect, args: &Val) -> Option<String> {
    let keys: &[&str] = match effect {
        Effect::FilesystemRead | Effect::FilesystemWrite => &["path", "file"],
        Effect::Network => &["url", "host"],
        _ => &[],
    };
    let obj = args.as_obj()?;
    keys.iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/* ===================== Tools & AI ===================== */

pub fn call_tool(ctx: &mut ExecutionContext<'_>, name: &str, args: Val) -> Result<Val, EngineError> {
    if ctx.in_function() {
        return Err(effect_in_function(ctx, &format!("call tool '{}'", name)));
    }
    let program = ctx.program;
    let tool = program
        .tool(name)
        .ok_or_else(|| EngineError::runtime(errors::UNKNOWN_TOOL, format!("Unknown tool '{}'", name)))?;

    let step_id = ctx.step_id("tool");
    for effect in &tool.capabilities {
        let target = effect_target(*effect, &args);
        capability::enforce(
            ctx,
            *effect,
            Subject::tool(&tool.name, tool.pack.as_deref()),
            target.as_deref(),
            &step_id,
        )?;
    }

    ctx.trace(TraceEvent::BoundaryStarted {
        boundary: "tool".to_string(),
        name: name.to_string(),
    });
    debug!(tool = name, "Calling tool");
    let result = ctx.tools.call(name, &args);
    let ok = result.is_ok();
    ctx.trace(TraceEvent::ToolCall {
        step_id,
        tool: name.to_string(),
        ok,
    });
    ctx.trace(TraceEvent::BoundaryFinished {
        boundary: "tool".to_string(),
        name: name.to_string(),
        ok,
    });
    result.map_err(|message| {
        EngineError::runtime(errors::TOOL_FAILED, format!("Tool '{}' failed: {}", name, message))
    })
}

pub fn call_ai(ctx: &mut ExecutionContext<'_>, profile_name: &str, input: Val) -> Result<Val, EngineError> {
    if ctx.in_function() {
        return Err(effect_in_function(ctx, &format!("ask AI profile '{}'", profile_name)));
    }
    let program = ctx.program;
    let profile = program.ai_profile(profile_name).ok_or_else(|| {
        EngineError::runtime(
            errors::UNKNOWN_AI_PROFILE,
            format!("Unknown AI profile '{}'", profile_name),
        )
    })?;

    if profile.provider != "mock" {
        let step_id = ctx.step_id("ai");
        capability::enforce(
            ctx,
            Effect::Network,
            Subject::tool(&profile.name, None),
            Some(&profile.provider),
            &step_id,
        )?;
    }

    ctx.trace(TraceEvent::BoundaryStarted {
        boundary: "ai".to_string(),
        name: profile_name.to_string(),
    });
    let result = ctx.ai.complete(profile, &input);
    ctx.trace(TraceEvent::BoundaryFinished {
        boundary: "ai".to_string(),
        name: profile_name.to_string(),
        ok: result.is_ok(),
    });
    result.map_err(|message| {
        EngineError::runtime(
            errors::AI_FAILED,
            format!("AI profile '{}' failed: {}", profile_name, message),
        )
    })
}

/* ===================== Flows & Pipelines ===================== */

pub fn call_flow(ctx: &mut ExecutionContext<'_>, name: &str, args: Val) -> Result<Val, EngineError> {
    if ctx.in_function() {
        return Err(effect_in_function(ctx, &format!("call flow '{}'", name)));
    }
    let program = ctx.program;
    let flow = program
        .flow(name)
        .ok_or_else(|| EngineError::runtime(errors::UNKNOWN_FLOW, format!("Unknown flow '{}'", name)))?;
    if ctx.flow_stack.iter().any(|f| f == name) {
        return Err(EngineError::runtime(
            errors::RECURSIVE_FLOW,
            format!("Flow '{}' is already running and cannot call itself", name),
        ));
    }
    ctx.check_depth()?;

    let caller = ctx.flow_name.clone();
    ctx.trace(TraceEvent::FlowCallStarted {
        flow_name: name.to_string(),
        caller: caller.clone(),
    });

    let mut locals = BTreeMap::new();
    if let Some(obj) = args.as_obj() {
        locals.extend(obj.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    locals.insert("input".to_string(), args);

    let frame = ctx.push_frame(Some(name), locals);
    ctx.flow_stack.push(name.to_string());
    let result = super::executor::enforce_flow_requires(ctx, flow).and_then(|_| exec_block(ctx, &flow.body));
    let last_value = std::mem::take(&mut ctx.last_value);
    ctx.flow_stack.pop();
    ctx.pop_frame(frame);

    ctx.trace(TraceEvent::FlowCallFinished {
        flow_name: name.to_string(),
        caller,
        ok: result.is_ok(),
    });
    match result? {
        Control::Return(value) => Ok(value),
        Control::Continue => Ok(last_value),
    }
}

pub fn call_pipeline(ctx: &mut ExecutionContext<'_>, name: &str, input: Val) -> Result<Val, EngineError> {
    if ctx.in_function() {
        return Err(effect_in_function(ctx, &format!("run pipeline '{}'", name)));
    }
    let program = ctx.program;
    let pipeline = program.pipeline(name).ok_or_else(|| {
        EngineError::runtime(errors::UNKNOWN_PIPELINE, format!("Unknown pipeline '{}'", name))
    })?;

    ctx.trace(TraceEvent::PipelineStarted {
        pipeline: name.to_string(),
        steps: pipeline.steps.clone(),
    });
    let mut value = input;
    let mut outcome = Ok(());
    for step in &pipeline.steps {
        let args = Val::Obj(BTreeMap::from([("input".to_string(), value.clone())]));
        match call_tool(ctx, step, args) {
            Ok(next) => value = next,
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }
    ctx.trace(TraceEvent::PipelineFinished {
        pipeline: name.to_string(),
        ok: outcome.is_ok(),
    });
    outcome.map(|_| value)
}

/* ===================== Pure Functions ===================== */

pub fn call_function(ctx: &mut ExecutionContext<'_>, name: &str, args: Vec<Val>) -> Result<Val, EngineError> {
    let program = ctx.program;
    let function = program.function(name).ok_or_else(|| {
        EngineError::runtime(errors::UNKNOWN_FUNCTION, format!("Unknown function '{}'", name))
    })?;
    if function.params.len() != args.len() {
        return Err(EngineError::runtime(
            errors::WRONG_ARG_COUNT,
            format!(
                "Function '{}' expects {} arguments, got {}",
                name,
                function.params.len(),
                args.len()
            ),
        ));
    }
    ctx.check_depth()?;

    let locals = function.params.iter().cloned().zip(args).collect();
    let frame = ctx.push_frame(None, locals);
    ctx.call_stack.push(name.to_string());
    let result = exec_block(ctx, &function.body);
    ctx.call_stack.pop();
    ctx.pop_frame(frame);

    match result? {
        Control::Return(value) => Ok(value),
        Control::Continue => Ok(Val::Null),
    }
}
