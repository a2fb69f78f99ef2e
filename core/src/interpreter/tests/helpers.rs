//! Test helpers for engine tests
//!
//! Common utilities for loading JSON programs and running flows

use crate::config::EngineConfig;
use crate::interpreter::{
    Engine, ExecutionResult, MockAiProvider, Program, Providers, RecordingObserver, RunError, RunRequest,
    StaticToolRunner, TraceEvent, Val,
};
use crate::storage::{MemoryStore, Storage};

/// Parse a lowered program fixture
pub fn program(json: &str) -> Program {
    serde_json::from_str(json).expect("Program fixture must parse")
}

/// Configuration that does not require a `requires` rule for writes
pub fn permissive() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.mutation.require_rule = false;
    config
}

/// Everything a run hands back plus what the providers saw
pub struct Outcome {
    pub result: Result<ExecutionResult, RunError>,
    pub tools: StaticToolRunner,
    pub observer: RecordingObserver,
}

impl Outcome {
    pub fn ok(self) -> ExecutionResult {
        match self.result {
            Ok(result) => result,
            Err(failure) => panic!("Flow failed: {:?}", failure.error),
        }
    }

    pub fn err(self) -> RunError {
        match self.result {
            Ok(result) => panic!("Flow succeeded with {:?}", result.last_value),
            Err(failure) => failure,
        }
    }
}

pub struct Runner {
    pub engine: Engine,
    pub tools: StaticToolRunner,
}

impl Runner {
    pub fn new(json: &str, config: EngineConfig) -> Self {
        Self {
            engine: Engine::new(program(json), config),
            tools: StaticToolRunner::new(),
        }
    }

    pub fn tools(mut self, tools: StaticToolRunner) -> Self {
        self.tools = tools;
        self
    }

    /// Run against a fresh in-memory store
    pub fn run(self, request: RunRequest) -> Outcome {
        let mut store = MemoryStore::new();
        self.run_on(&mut store, request)
    }

    pub fn run_on(mut self, store: &mut dyn Storage, request: RunRequest) -> Outcome {
        let mut ai = MockAiProvider::new();
        let mut observer = RecordingObserver::default();
        let result = self.engine.run(
            store,
            Providers {
                tools: &mut self.tools,
                ai: &mut ai,
                observer: &mut observer,
            },
            request,
        );
        Outcome {
            result,
            tools: self.tools,
            observer,
        }
    }
}

/// Names of the trace events, in order
pub fn event_names(events: &[TraceEvent]) -> Vec<&'static str> {
    events.iter().map(TraceEvent::name).collect()
}

pub fn obj(pairs: &[(&str, Val)]) -> Val {
    Val::Obj(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
}
