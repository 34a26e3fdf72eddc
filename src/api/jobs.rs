/// Worker and job submission endpoints
///
/// Jobs posted here go onto the in-process queue. In a multi-process
/// deployment the trigger layer feeds the queue directly instead.

use crate::api::AppState;
use crate::runtime::WorkerStatus;
use crate::queue::QueueStats;
use crate::workflow::types::ExecutionJob;
use crate::workflow::validation::ValidatedWorkflow;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};

/// Worker status plus queue counters
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusResponse {
    #[serde(flatten)]
    pub worker: WorkerStatus,
    pub queue: QueueStats,
}

/// Create worker and job routes
pub fn create_job_routes() -> Router<AppState> {
    Router::new()
        .route("/api/worker/status", get(worker_status))
        .route("/api/jobs", post(submit_job))
}

/// GET /api/worker/status
pub(crate) async fn worker_status(State(state): State<AppState>) -> Json<WorkerStatusResponse> {
    Json(WorkerStatusResponse {
        worker: state.worker.status(),
        queue: state.worker.queue().stats(),
    })
}

/// Enqueue an execution job
///
/// POST /api/jobs
/// Body: an `ExecutionJob`; an empty `executionId` gets a generated one.
/// Returns 202 with the execution id, or 400 when the graph is invalid.
pub(crate) async fn submit_job(
    State(state): State<AppState>,
    Json(mut job): Json<ExecutionJob>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if job.execution_id.trim().is_empty() {
        job.execution_id = uuid::Uuid::new_v4().to_string();
    }

    if let Err(e) = ValidatedWorkflow::from_job(&job) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string(), "code": e.code() })),
        ));
    }

    let execution_id = job.execution_id.clone();
    if let Err(e) = state.worker.queue().enqueue(job).await {
        tracing::error!("Failed to enqueue execution {}: {}", execution_id, e);
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ));
    }

    tracing::info!("📥 Accepted execution {}", execution_id);
    Ok((StatusCode::ACCEPTED, Json(json!({ "executionId": execution_id }))))
}
