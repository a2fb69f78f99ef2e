//! # Flow execution engine
//!
//! Walks lowered program statements, mediates every side effect through the
//! capability gate and the mutation policy, and records a deterministic trace.
//!
//! ## Layout
//!
//! - [`types`] - program IR, runtime values and record schemas
//! - [`context`] - per-run mutable state
//! - [`statements`] / [`expressions`] / [`calls`] - the interpreter proper
//! - [`capability`] / [`mutation`] - effect gating
//! - [`concurrency`] / [`parallel`] - async tasks and parallel blocks
//! - [`executor`] - the run lifecycle around all of the above

pub mod calls;
pub mod capability;
pub mod concurrency;
pub mod context;
pub mod errors;
pub mod executor;
pub mod expressions;
pub mod mutation;
pub mod parallel;
pub mod providers;
pub mod statements;
pub mod trace;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use context::{ExecutionContext, Providers};
pub use errors::{EngineError, ErrorDetails, ErrorKind, SourceLocation};
pub use executor::{Engine, ExecutionResult, RunError, RunRequest};
pub use providers::{AiProvider, MockAiProvider, Observer, RecordingObserver, StaticToolRunner, ToolRunner, TracingObserver};
pub use trace::{trace_digest, ExecutionStep, TraceEvent};
pub use types::{Program, Val};
