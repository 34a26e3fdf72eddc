/// HTTP API Layer
///
/// This module provides the monitoring REST API of a worker process. It
/// handles:
/// - Worker status and queue counters
/// - Live execution state and the recent-event backlog
/// - Job submission
/// - Cancel, pause and resume of executions

// Execution state, events and status controls
pub mod executions;

// Worker status and job submission
pub mod jobs;

use crate::events::RecentEventBuffer;
use crate::runtime::ExecutionWorker;
use crate::state::ExecutionStateStore;
use axum::Router;
use std::sync::Arc;

// Re-export router builders
pub use executions::create_execution_routes;
pub use jobs::create_job_routes;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Live execution state
    pub state: Arc<dyn ExecutionStateStore>,
    /// Backlog fed by the event subscriber
    pub recent_events: Arc<RecentEventBuffer>,
    /// Worker pool and its queue
    pub worker: Arc<ExecutionWorker>,
}

/// All API routes bound to one application state
pub fn create_api_routes(state: AppState) -> Router {
    Router::new()
        .merge(create_execution_routes())
        .merge(create_job_routes())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialLookup;
    use crate::events::{ExecutionEventMessage, ExecutionEventPublisher, ExecutionEventType, NativeEventBus};
    use crate::queue::InMemoryJobQueue;
    use crate::runtime::EngineServices;
    use crate::state::{ExecutionStatus, InMemoryStateStore, QueueExecutionContext};
    use crate::workflow::registry::NodeTypeRegistry;
    use crate::workflow::types::ExecutionJob;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::Json;
    use serde_json::json;
    use std::time::Duration;

    fn app_state() -> AppState {
        let state: Arc<dyn ExecutionStateStore> = Arc::new(InMemoryStateStore::default());
        let services = EngineServices {
            state: Arc::clone(&state),
            publisher: ExecutionEventPublisher::new(Arc::new(NativeEventBus::new())),
            node_types: Arc::new(NodeTypeRegistry::new()),
            credentials: Arc::new(StaticCredentialLookup::new()),
            history: None,
            node_timeout: Duration::from_secs(5),
        };
        AppState {
            state,
            recent_events: Arc::new(RecentEventBuffer::new(10, Duration::from_secs(60))),
            worker: Arc::new(ExecutionWorker::new(services, Arc::new(InMemoryJobQueue::default()), 1)),
        }
    }

    fn job(execution_id: &str) -> ExecutionJob {
        serde_json::from_value(json!({
            "executionId": execution_id,
            "workflowId": "wf",
            "userId": "u1",
            "nodes": [{"id": "a", "type": "set"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_job_generates_id_and_enqueues() {
        let state = app_state();
        let (status, Json(body)) = jobs::submit_job(State(state.clone()), Json(job("")))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(!body["executionId"].as_str().unwrap().is_empty());
        assert_eq!(state.worker.queue().stats().waiting, 1);

        let Json(worker) = jobs::worker_status(State(state)).await;
        assert_eq!(worker.queue.waiting, 1);
        assert!(!worker.worker.is_running);
    }

    #[tokio::test]
    async fn test_submit_invalid_job_is_rejected() {
        let mut invalid = job("e1");
        invalid.nodes.push(invalid.nodes[0].clone());

        let (status, Json(body)) = jobs::submit_job(State(app_state()), Json(invalid))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_WORKFLOW");
    }

    #[tokio::test]
    async fn test_execution_state_and_cancel() {
        let state = app_state();
        assert_eq!(
            executions::get_execution(State(state.clone()), Path("e1".to_string()))
                .await
                .unwrap_err(),
            StatusCode::NOT_FOUND
        );

        state
            .state
            .create_state("e1", QueueExecutionContext::from_job(&job("e1")))
            .await
            .unwrap();
        let Json(context) = executions::get_execution(State(state.clone()), Path("e1".to_string()))
            .await
            .unwrap();
        assert_eq!(context.status, ExecutionStatus::Pending);

        // Repeated cancellation is idempotent
        for _ in 0..2 {
            executions::cancel_execution(State(state.clone()), Path("e1".to_string()))
                .await
                .unwrap();
        }
        // Nothing was running, so the request itself finalized it
        let cancelled = state.state.get_state("e1").await.unwrap().unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(cancelled.finalized);
        assert!(cancelled.finished_at.is_some());

        state
            .state
            .create_state("e2", QueueExecutionContext::from_job(&job("e2")))
            .await
            .unwrap();
        state.state.update_status("e2", ExecutionStatus::Completed).await.unwrap();
        assert_eq!(
            executions::cancel_execution(State(state.clone()), Path("e2".to_string()))
                .await
                .unwrap_err(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            executions::cancel_execution(State(state), Path("missing".to_string()))
                .await
                .unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume_execution() {
        let state = app_state();
        state
            .state
            .create_state("e1", QueueExecutionContext::from_job(&job("e1")))
            .await
            .unwrap();

        // Only a paused execution can be resumed
        assert_eq!(
            executions::resume_execution(State(state.clone()), Path("e1".to_string()))
                .await
                .unwrap_err(),
            StatusCode::CONFLICT
        );

        let Json(body) = executions::pause_execution(State(state.clone()), Path("e1".to_string()))
            .await
            .unwrap();
        assert_eq!(body["status"], "paused");

        let Json(body) = executions::resume_execution(State(state.clone()), Path("e1".to_string()))
            .await
            .unwrap();
        assert_eq!(body["status"], "running");
        assert_eq!(
            state.state.get_state("e1").await.unwrap().unwrap().status,
            ExecutionStatus::Running
        );

        assert_eq!(
            executions::pause_execution(State(state), Path("missing".to_string()))
                .await
                .unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_recent_events_endpoint() {
        let state = app_state();
        state
            .recent_events
            .push(ExecutionEventMessage::new(ExecutionEventType::Started, "e1"));

        let Json(body) = executions::get_execution_events(State(state), Path("e1".to_string())).await;
        assert_eq!(body["events"].as_array().unwrap().len(), 1);
        assert_eq!(body["events"][0]["type"], "started");
    }
}
