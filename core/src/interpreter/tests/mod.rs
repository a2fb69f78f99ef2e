//! Engine tests
//!
//! Programs are written as JSON fixtures in the lowered IR and run end to
//! end through [`Engine::run`](crate::interpreter::Engine::run).

mod async_tests;
mod control_tests;
mod helpers;
mod mutation_tests;
mod structural_tests;
