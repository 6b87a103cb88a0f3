/// Workflow definition endpoints
///
/// Definitions are upserted with an `active` flag, hot-reloaded into the
/// registry and followed by a scheduler reconciliation so cron edits take
/// effect without waiting for the next pass. Manual runs go through the worker
/// pool like every other execution.

use crate::api::{error_status, AppState};
use crate::runtime::engine::RunOptions;
use crate::workflow::registry::DefinitionSource;
use crate::workflow::types::WorkflowDefinition;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Response for workflow upsert operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub active: bool,
    pub message: String,
}

/// Request body for workflow upsert
#[derive(Debug, Deserialize)]
pub struct UpsertWorkflowRequest {
    pub workflow: WorkflowDefinition,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Request body for a manual run; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub input: Value,
    /// Return immediately with the execution id instead of the final result
    #[serde(default)]
    pub detach: bool,
    /// Pause before every node
    #[serde(default)]
    pub step_mode: bool,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(upsert_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/run", post(run_workflow))
}

/// PUT /api/workflows/{id}
/// Body: { "workflow": { "id": "...", "nodes": [...], "edges": [...] }, "active": true }
async fn upsert_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpsertWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let mut workflow = payload.workflow;
    // The URL wins over the body
    workflow.id = id.clone();

    if workflow.nodes.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match &state.storage {
        Some(storage) => {
            if let Err(e) = storage.save_workflow(&workflow, payload.active).await {
                tracing::error!("Failed to save workflow {}: {}", id, e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
            if let Err(e) = state.registry.reload_workflow(&id).await {
                tracing::error!("Failed to reload workflow {} into registry: {}", id, e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
        None => state.registry.upsert(workflow, payload.active),
    }

    reconcile_scheduler(&state).await;
    tracing::info!("🔥 Upserted workflow: {} (active: {})", id, payload.active);

    Ok(Json(WorkflowResponse {
        id: id.clone(),
        active: payload.active,
        message: format!("Workflow '{}' saved", id),
    }))
}

/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let mut workflows = Vec::new();
    for id in state.registry.list_workflow_ids() {
        let Some(definition) = state.registry.get_workflow(&id) else {
            continue;
        };
        let active = state.registry.is_active(&id).await.unwrap_or(false);
        workflows.push(json!({
            "id": definition.id,
            "name": definition.name,
            "active": active,
            "nodes": definition.nodes.len(),
        }));
    }
    workflows.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));

    Ok(Json(json!({ "workflows": workflows })))
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, StatusCode> {
    match state.registry.load_definition(&id).await {
        Ok(Some(definition)) => Ok(Json((*definition).clone())),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let existed = match &state.storage {
        Some(storage) => match storage.delete_workflow(&id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::error!("Failed to delete workflow {}: {}", id, e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        None => state.registry.get_workflow(&id).is_some(),
    };
    state.registry.remove(&id);

    if !existed {
        return Err(StatusCode::NOT_FOUND);
    }

    reconcile_scheduler(&state).await;
    Ok(Json(json!({ "message": format!("Workflow '{}' deleted", id) })))
}

/// POST /api/workflows/{id}/run
/// Body (optional): { "input": {...}, "detach": false, "stepMode": false }
async fn run_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let request: RunRequest = if body.trim().is_empty() {
        RunRequest::default()
    } else {
        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!("❌ Invalid run request for workflow {}: {}", id, e);
            StatusCode::BAD_REQUEST
        })?
    };

    let definition = match state.registry.load_definition(&id).await {
        Ok(Some(definition)) => definition,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load workflow {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let execution_id = uuid::Uuid::new_v4().to_string();
    let options = RunOptions {
        execution_id: Some(execution_id.clone()),
        metadata: request
            .step_mode
            .then(|| json!({ "debug": { "stepMode": true } })),
    };

    tracing::info!("📥 Manual run requested for workflow {} ({})", id, execution_id);

    if request.detach {
        state.pool.spawn(definition, request.input, None, options);
        return Ok((StatusCode::ACCEPTED, Json(json!({ "executionId": execution_id }))));
    }

    match state.pool.submit(definition, request.input, None, options).await {
        Ok(result) => Ok((StatusCode::OK, Json(json!(result)))),
        Err(e) => {
            tracing::error!("❌ Workflow {} run failed: {}", id, e);
            Err(error_status(&e))
        }
    }
}

async fn reconcile_scheduler(state: &AppState) {
    if let Some(scheduler) = &state.scheduler {
        if let Err(e) = scheduler.reconcile().await {
            tracing::warn!("⚠️ Cron reconciliation after workflow change failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{create_router, test_support};
    use axum::http::Method;

    fn branching_workflow() -> Value {
        json!({
            "workflow": {
                "id": "ignored",
                "name": "branching",
                "nodes": [
                    { "id": "start", "type": "trigger.manual" },
                    { "id": "check", "type": "logic.if", "config": { "condition": "input.amount > 10" } },
                    { "id": "big", "type": "util.set", "config": { "values": { "size": "big" } } },
                    { "id": "small", "type": "util.set", "config": { "values": { "size": "small" } } }
                ],
                "edges": [
                    { "source": "start", "target": "check" },
                    { "source": "check", "target": "big", "sourceHandle": "true" },
                    { "source": "check", "target": "small", "sourceHandle": "false" }
                ]
            }
        })
    }

    #[tokio::test]
    async fn test_upsert_list_and_delete() {
        let app = create_router(test_support::state());

        let (status, body) = test_support::call(&app, Method::PUT, "/api/workflows/wf-1", Some(branching_workflow())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], json!("wf-1"));

        let (_, listed) = test_support::call(&app, Method::GET, "/api/workflows", None).await;
        assert_eq!(listed["workflows"][0]["id"], json!("wf-1"));
        assert_eq!(listed["workflows"][0]["active"], json!(true));

        let (status, _) = test_support::call(&app, Method::DELETE, "/api/workflows/wf-1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = test_support::call(&app, Method::GET, "/api/workflows/wf-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_returns_branch_outputs() {
        let app = create_router(test_support::state());
        test_support::call(&app, Method::PUT, "/api/workflows/wf-1", Some(branching_workflow())).await;

        let (status, body) = test_support::call(
            &app,
            Method::POST,
            "/api/workflows/wf-1/run",
            Some(json!({ "input": { "amount": 42 } })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("completed"));
        assert_eq!(body["output"]["big"]["size"], json!("big"));
        assert!(body["output"].get("small").is_none());
    }

    #[tokio::test]
    async fn test_run_unknown_workflow_is_404() {
        let app = create_router(test_support::state());
        let (status, _) = test_support::call(&app, Method::POST, "/api/workflows/nope/run", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
