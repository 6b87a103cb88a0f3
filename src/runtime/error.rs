/// Engine-level error taxonomy
///
/// Node failures are values (`NodeResult` with `success: false`) and never show
/// up here. These errors unwind a branch: cancellation, pause timeouts, loop
/// guards and store faults. They travel inside `anyhow::Error`; use
/// `EngineError::classify` to recover them.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Execution {execution_id} was cancelled")]
    Cancelled { execution_id: String },

    #[error("Execution {execution_id} timed out after {waited:?} waiting for resume at node '{node_id}'")]
    PauseTimeout {
        execution_id: String,
        node_id: String,
        waited: Duration,
    },

    #[error("Loop node '{node_id}' exceeded its iteration limit of {limit}")]
    LoopGuardExceeded { node_id: String, limit: usize },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Find an `EngineError` anywhere in an anyhow chain
    pub fn classify(error: &anyhow::Error) -> Option<&EngineError> {
        error.chain().find_map(|cause| cause.downcast_ref::<EngineError>())
    }

    pub fn is_cancellation(error: &anyhow::Error) -> bool {
        matches!(Self::classify(error), Some(EngineError::Cancelled { .. }))
    }
}
