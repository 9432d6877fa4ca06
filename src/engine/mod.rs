// ABOUTME: Flow execution engine module for the tideway workflow engine
// ABOUTME: Handles state synchronization, task execution, mapping, and flow orchestration

pub mod error;
pub mod flow_runner;
pub mod mapper;
pub mod pool;
pub mod sync;
pub mod task_runner;

pub use error::{EngineError, Result};
pub use flow_runner::FlowRunner;
pub use mapper::{EdgeView, MapOutcome, Mapper};
pub use pool::{ExecutionPool, Outcome};
pub use sync::{FlowRunHandle, Proposal, StateSync, TaskRunHandle};
pub use task_runner::TaskRunner;
