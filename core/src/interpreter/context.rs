//! Execution context
//!
//! One [`ExecutionContext`] exists per run. It owns the bindings, the working
//! state tree, the trace recorder and the concurrency bookkeeping, and holds
//! borrowed handles to the program, configuration, store and providers.
//! It is never shared across runs or threads.

use super::concurrency::TaskTable;
use super::errors::EngineError;
use super::providers::{AiProvider, Observer, ToolRunner};
use super::trace::{Recorder, TraceEvent};
use super::types::{Flow, Program, Val};
use crate::config::EngineConfig;
use crate::storage::{RecordScope, Storage};
use std::collections::{BTreeMap, BTreeSet};

/// External collaborators handed to a run
pub struct Providers<'r> {
    pub tools: &'r mut dyn ToolRunner,
    pub ai: &'r mut dyn AiProvider,
    pub observer: &'r mut dyn Observer,
}

/// The parts of the context an async task or parallel branch runs against
/// and that are swapped back afterwards
#[derive(Debug, Clone)]
pub struct Bindings {
    pub locals: BTreeMap<String, Val>,
    pub constants: BTreeSet<String>,
    pub state: Val,
    pub last_value: Val,
}

/// Saved caller frame while a nested flow or function runs
#[derive(Debug)]
pub struct Frame {
    flow_name: String,
    locals: BTreeMap<String, Val>,
    constants: BTreeSet<String>,
    last_value: Val,
}

pub struct ExecutionContext<'r> {
    pub program: &'r Program,
    pub config: &'r EngineConfig,
    pub store: &'r mut dyn Storage,
    pub tools: &'r mut dyn ToolRunner,
    pub ai: &'r mut dyn AiProvider,
    pub observer: &'r mut dyn Observer,

    pub flow_name: String,
    pub locals: BTreeMap<String, Val>,
    pub constants: BTreeSet<String>,
    pub state: Val,
    pub identity: Val,
    pub scope: RecordScope,
    pub last_value: Val,

    pub recorder: Recorder,

    /// Pure function frames; non-empty means record access is illegal
    pub call_stack: Vec<String>,
    /// Flows currently executing, outermost first
    pub flow_stack: Vec<String>,

    pub tasks: TaskTable,
    pub parallel_mode: bool,
    pub parallel_task: Option<String>,

    step_counter: u64,
}

impl<'r> ExecutionContext<'r> {
    pub fn new(
        program: &'r Program,
        config: &'r EngineConfig,
        store: &'r mut dyn Storage,
        providers: Providers<'r>,
        flow: &Flow,
        identity: Val,
    ) -> Self {
        let scope = RecordScope::from_identity(&identity);
        Self {
            program,
            config,
            store,
            tools: providers.tools,
            ai: providers.ai,
            observer: providers.observer,
            flow_name: flow.name.clone(),
            locals: BTreeMap::new(),
            constants: BTreeSet::new(),
            state: Val::obj(),
            identity,
            scope,
            last_value: Val::Null,
            recorder: Recorder::default(),
            call_stack: Vec::new(),
            flow_stack: vec![flow.name.clone()],
            tasks: TaskTable::default(),
            parallel_mode: false,
            parallel_task: None,
            step_counter: 0,
        }
    }

    /* ===================== Step Identity ===================== */

    /// Advance the statement counter; called once per executed statement
    pub fn advance_step(&mut self) -> u64 {
        self.step_counter += 1;
        self.step_counter
    }

    pub fn current_ordinal(&self) -> u64 {
        self.step_counter
    }

    /// Deterministic id for an action taken by the current statement
    pub fn step_id(&self, action_kind: &str) -> String {
        format!("{}:{}:{}", self.flow_name, action_kind, self.step_counter)
    }

    pub fn trace(&mut self, event: TraceEvent) {
        self.recorder.push(event);
    }

    pub fn in_function(&self) -> bool {
        !self.call_stack.is_empty()
    }

    pub fn current_flow(&self) -> Option<&'r Flow> {
        self.program.flow(&self.flow_name)
    }

    /* ===================== Bindings ===================== */

    pub fn lookup(&self, name: &str) -> Option<Val> {
        match name {
            "state" => Some(self.state.clone()),
            "identity" => Some(self.identity.clone()),
            _ => self.locals.get(name).cloned(),
        }
    }

    /// Declare or rebind a local; constants cannot be rebound
    pub fn bind(&mut self, name: &str, value: Val) -> Result<(), EngineError> {
        if self.constants.contains(name) {
            return Err(reassignment(name));
        }
        self.locals.insert(name.to_string(), value);
        Ok(())
    }

    pub fn snapshot(&self) -> Bindings {
        Bindings {
            locals: self.locals.clone(),
            constants: self.constants.clone(),
            state: self.state.clone(),
            last_value: self.last_value.clone(),
        }
    }

    pub fn restore(&mut self, bindings: Bindings) {
        self.locals = bindings.locals;
        self.constants = bindings.constants;
        self.state = bindings.state;
        self.last_value = bindings.last_value;
    }

    /// Enter a nested flow or function with a fresh local scope
    pub fn push_frame(&mut self, flow_name: Option<&str>, locals: BTreeMap<String, Val>) -> Frame {
        let frame = Frame {
            flow_name: self.flow_name.clone(),
            locals: std::mem::replace(&mut self.locals, locals),
            constants: std::mem::take(&mut self.constants),
            last_value: std::mem::take(&mut self.last_value),
        };
        if let Some(name) = flow_name {
            self.flow_name = name.to_string();
        }
        frame
    }

    pub fn pop_frame(&mut self, frame: Frame) {
        self.flow_name = frame.flow_name;
        self.locals = frame.locals;
        self.constants = frame.constants;
        self.last_value = frame.last_value;
    }

    /* ===================== Limits ===================== */

    pub fn call_depth(&self) -> usize {
        self.call_stack.len() + self.flow_stack.len()
    }

    pub fn check_depth(&self) -> Result<(), EngineError> {
        let max = self.config.limits.max_call_depth;
        if self.call_depth() >= max {
            return Err(EngineError::runtime(
                super::errors::LIMIT_EXCEEDED,
                format!("Call depth limit of {} exceeded", max),
            ));
        }
        Ok(())
    }
}

pub fn reassignment(name: &str) -> EngineError {
    EngineError::new(
        super::errors::ErrorKind::Reassignment,
        super::errors::CONSTANT_REASSIGNMENT,
        format!("Cannot reassign constant '{}'", name),
    )
    .with_hint(format!("Declare '{}' without `constant` or use a new name.", name))
}
