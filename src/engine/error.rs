// ABOUTME: Error taxonomy for engine passes
// ABOUTME: Separates definition-time graph problems from store faults

use thiserror::Error;

use crate::flow::FlowError;
use crate::state::IllegalTransition;
use crate::store::StoreError;

/// Errors surfaced to the caller of a flow-runner pass. Execution failures,
/// timeouts, and trigger rejections never appear here: they travel as
/// terminal `State` values. Version conflicts are absorbed inside the
/// synchronization layer's callers and never escape either.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed mapped-edge cardinality or a missing upstream record. The
    /// only class that aborts a pass outright.
    #[error("graph inconsistency: {message}")]
    GraphInconsistency { message: String },

    /// A proposal that the state model's transition table forbids. Caught
    /// before the store is touched.
    #[error(transparent)]
    Transition(#[from] IllegalTransition),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn graph(message: impl Into<String>) -> Self {
        EngineError::GraphInconsistency {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
