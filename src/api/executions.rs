/// Execution inspection and debug control endpoints
///
/// GET  /api/executions/{id}
/// GET  /api/executions/{id}/steps
/// POST /api/executions/{id}/resume        body: { "modifications": {...} } (optional)
/// POST /api/executions/{id}/step
/// POST /api/executions/{id}/cancel
/// POST /api/executions/{id}/replay
/// POST /api/executions/{id}/nodes/{node_id}/input   body: JSON payload
/// POST /api/executions/{id}/signal?node=...         body: raw `resume` | `cancel` | JSON

use crate::api::{error_status, AppState};
use crate::runtime::error::EngineError;
use crate::workflow::registry::DefinitionSource;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
pub struct SignalQuery {
    pub node: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub modifications: Option<Value>,
}

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/steps", get(list_steps))
        .route("/api/executions/{id}/resume", post(resume_execution))
        .route("/api/executions/{id}/step", post(step_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/replay", post(replay_execution))
        .route("/api/executions/{id}/nodes/{node_id}/input", post(submit_input))
        .route("/api/executions/{id}/signal", post(publish_signal))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let engine = state.pool.engine();
    match engine.get_execution(&id).await {
        Ok(Some(execution)) => {
            let waiting = engine.pause_hub().waiting_nodes(&id);
            let mut body = json!(execution);
            body["waitingNodes"] = json!(waiting);
            Ok(Json(body))
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load execution {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn list_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let engine = state.pool.engine();
    match engine.get_execution(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load execution {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    match engine.list_steps(&id).await {
        Ok(steps) => Ok(Json(json!({ "steps": steps }))),
        Err(e) => {
            tracing::error!("Failed to list steps of {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn resume_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> Result<Json<Value>, StatusCode> {
    let request: ResumeRequest = if body.trim().is_empty() {
        ResumeRequest::default()
    } else {
        serde_json::from_str(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };

    match state.pool.engine().resume(&id, request.modifications) {
        Ok(released) => Ok(Json(json!({ "released": released }))),
        Err(e) => Err(error_status(&e)),
    }
}

async fn step_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.pool.engine().step(&id) {
        Ok(released) => Ok(Json(json!({ "released": released }))),
        Err(e) => Err(error_status(&e)),
    }
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.pool.engine().cancel(&id).await {
        Ok(released) => Ok(Json(json!({ "released": released }))),
        Err(e) => {
            if !matches!(EngineError::classify(&e), Some(EngineError::ExecutionNotFound(_))) {
                tracing::error!("Failed to cancel execution {}: {}", id, e);
            }
            Err(error_status(&e))
        }
    }
}

/// Replays run detached; the response carries the new execution id
async fn replay_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let execution_id = uuid::Uuid::new_v4().to_string();
    let plan = match state.pool.engine().plan_replay(&id, Some(execution_id.clone())).await {
        Ok(plan) => plan,
        Err(e) => return Err(error_status(&e)),
    };

    let definition = match state.registry.load_definition(&plan.workflow_id).await {
        Ok(Some(definition)) => definition,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load workflow {}: {}", plan.workflow_id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    state.pool.spawn(definition, plan.input, None, plan.options);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "executionId": execution_id, "replayOf": id })),
    ))
}

async fn submit_input(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    match state.pool.engine().submit_input(&id, &node_id, payload) {
        Ok(true) => Ok(Json(json!({ "delivered": true }))),
        // Nobody was waiting on that node
        Ok(false) => Err(StatusCode::CONFLICT),
        Err(e) => Err(error_status(&e)),
    }
}

/// Raw pause-channel message, for transports that forward tokens verbatim
async fn publish_signal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SignalQuery>,
    body: String,
) -> Result<Json<Value>, StatusCode> {
    match state.pool.engine().publish(&id, query.node.as_deref(), &body).await {
        Ok(delivered) => Ok(Json(json!({ "delivered": delivered }))),
        Err(e) => match EngineError::classify(&e) {
            Some(_) => Err(error_status(&e)),
            None => {
                tracing::warn!("❌ Unreadable signal for execution {}: {}", id, e);
                Err(StatusCode::BAD_REQUEST)
            }
        },
    }
}
