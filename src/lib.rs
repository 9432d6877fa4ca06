// ABOUTME: Main library module for the tideway workflow engine
// ABOUTME: Exports all core modules and provides the public API

pub mod config;
pub mod engine;
pub mod flow;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{EngineError, ExecutionPool, FlowRunner, StateSync, TaskRunner};
pub use flow::{ConstantWork, Edge, Flow, RunContext, Task, Trigger, Work};
pub use state::{reduce_children, State};
pub use store::{FlowRunInfo, InMemoryStore, RunStore, StoreError, TaskRunInfo};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
