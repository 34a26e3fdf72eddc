/// Execution monitoring endpoints
///
/// Read-only views over live state and the recent-event backlog, plus the
/// cancel, pause and resume controls the engine honors between node steps.

use crate::api::AppState;
use crate::error::{EngineError, EngineResult, StateStoreError};
use crate::state::{ExecutionStatus, QueueExecutionContext};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

/// Create execution monitoring routes
pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/events", get(get_execution_events))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/pause", post(pause_execution))
        .route("/api/executions/{id}/resume", post(resume_execution))
}

/// Live state of an execution
///
/// GET /api/executions/{id}
pub(crate) async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueueExecutionContext>, StatusCode> {
    match state.state.get_state(&id).await {
        Ok(Some(context)) => Ok(Json(context)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to read execution {}: {}", id, e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Recently published events for an execution, oldest first
///
/// GET /api/executions/{id}/events
pub(crate) async fn get_execution_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    let events = state.recent_events.recent(&id);
    Json(json!({ "executionId": id, "events": events }))
}

/// Request cancellation
///
/// A running attempt stops before its next node; otherwise the execution is
/// finalized right away.
///
/// POST /api/executions/{id}/cancel
pub(crate) async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let result = state.worker.cancel(&id).await;
    status_change(&id, "cancel", ExecutionStatus::Cancelled, result)
}

/// Pause an execution before its next node
///
/// POST /api/executions/{id}/pause
pub(crate) async fn pause_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let result = state.worker.pause(&id).await;
    status_change(&id, "pause", ExecutionStatus::Paused, result)
}

/// Resume a paused execution from its last checkpoint
///
/// POST /api/executions/{id}/resume
pub(crate) async fn resume_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let result = state.worker.resume(&id).await;
    status_change(&id, "resume", ExecutionStatus::Running, result)
}

fn status_change(
    id: &str,
    action: &str,
    status: ExecutionStatus,
    result: EngineResult<bool>,
) -> Result<Json<Value>, StatusCode> {
    match result {
        Ok(true) => Ok(Json(json!({ "executionId": id, "status": status }))),
        Ok(false) => Err(StatusCode::CONFLICT),
        Err(EngineError::StateStore(StateStoreError::NotFound(_))) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to {} execution {}: {}", action, id, e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
