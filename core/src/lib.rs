pub mod cli;
pub mod config;
pub mod interpreter;
pub mod storage;

// Re-export main types
pub use config::EngineConfig;
pub use interpreter::{Engine, EngineError, ExecutionResult, Program, RunError, RunRequest, Val};
pub use storage::Storage;
