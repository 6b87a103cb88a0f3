/// HTTP API Layer
///
/// Thin control surface over the engine:
/// - Workflow definition upsert/list/delete and manual runs
/// - Execution inspection (record + step audit trail)
/// - Debug control: resume, step, cancel, replay, human input

// Workflow definitions and manual runs
pub mod workflows;

// Execution inspection and debug control
pub mod executions;

use crate::runtime::{error::EngineError, queue::WorkerPool, scheduler::CronSchedulerService};
use crate::workflow::{registry::WorkflowRegistry, storage::WorkflowStorage};
use axum::{http::StatusCode, Router};
use std::sync::Arc;

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    /// Hot-reload registry the engine and scheduler read from
    pub registry: Arc<WorkflowRegistry>,
    /// Persistent definitions; `None` keeps definitions in memory only
    pub storage: Option<WorkflowStorage>,
    /// Bounded worker pool (owns the engine)
    pub pool: Arc<WorkerPool>,
    /// Reconciled after definition changes so cron edits apply immediately
    pub scheduler: Option<Arc<CronSchedulerService>>,
}

/// Build every API route on top of the shared state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(workflows::create_workflow_routes())
        .merge(executions::create_execution_routes())
        .with_state(state)
}

/// Map an engine/store error to a status code
pub(crate) fn error_status(error: &anyhow::Error) -> StatusCode {
    match EngineError::classify(error) {
        Some(EngineError::ExecutionNotFound(_)) | Some(EngineError::NodeNotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
