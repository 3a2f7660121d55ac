//! Job orchestration: runners, the local queue engine and the
//! ownership-scoped dispatcher.

pub mod dispatcher;
pub mod engine;
pub mod runner;

pub use dispatcher::JobDispatcher;
pub use engine::{JobEngine, JobResult, LocalJobEngine};
pub use runner::{Chain, ChainRunner, ChainStep, FnRunner, Runner, RunnerFactory, RunnerRegistry};
