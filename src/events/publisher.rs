/// Execution event publisher
///
/// Used inside worker processes to announce lifecycle and per-node events on
/// the shared broadcast channel. Publishing is best effort: a failed publish is
/// logged and never fails the execution.

use crate::events::bus::EventBus;
use crate::events::types::{ExecutionEventMessage, ExecutionEventType};
use serde_json::{json, Value};
use std::sync::Arc;

/// Publishes `ExecutionEventMessage`s as JSON on an `EventBus`
#[derive(Clone)]
pub struct ExecutionEventPublisher {
    bus: Arc<dyn EventBus>,
}

impl ExecutionEventPublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    /// Publish a prepared message
    pub async fn publish(&self, event: ExecutionEventMessage) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("❌ Failed to serialize {} event: {}", event.event_type.as_str(), e);
                return;
            }
        };

        if let Err(e) = self.bus.publish(payload).await {
            tracing::warn!(
                "⚠️ Failed to publish {} for execution {}: {}",
                event.event_type.as_str(),
                event.execution_id,
                e
            );
        }
    }

    pub async fn execution_started(&self, execution_id: &str, workflow_id: &str, resumed_from: Option<&str>) {
        self.publish(
            ExecutionEventMessage::new(ExecutionEventType::Started, execution_id)
                .with_payload(json!({ "workflowId": workflow_id, "resumedFrom": resumed_from })),
        )
        .await;
    }

    pub async fn node_started(&self, execution_id: &str, node_id: &str, node_type: &str) {
        self.publish(
            ExecutionEventMessage::for_node(ExecutionEventType::NodeStarted, execution_id, node_id)
                .with_payload(json!({ "nodeType": node_type })),
        )
        .await;
    }

    /// Node finished; `active_connections` lists the downstream connections
    /// that carry data for their source branch
    pub async fn node_completed(
        &self,
        execution_id: &str,
        node_id: &str,
        output: &Value,
        active_connections: Vec<Value>,
        duration_ms: u64,
    ) {
        self.publish(
            ExecutionEventMessage::for_node(ExecutionEventType::NodeCompleted, execution_id, node_id)
                .with_payload(json!({
                    "output": output,
                    "activeConnections": active_connections,
                    "durationMs": duration_ms,
                })),
        )
        .await;
    }

    pub async fn node_failed(&self, execution_id: &str, node_id: &str, error: &str) {
        self.publish(
            ExecutionEventMessage::for_node(ExecutionEventType::NodeFailed, execution_id, node_id)
                .with_payload(json!({ "error": error })),
        )
        .await;
    }

    pub async fn node_status_update(&self, execution_id: &str, node_id: &str, status: &str) {
        self.publish(
            ExecutionEventMessage::for_node(ExecutionEventType::NodeStatusUpdate, execution_id, node_id)
                .with_payload(json!({ "status": status })),
        )
        .await;
    }

    pub async fn execution_progress(&self, execution_id: &str, completed: usize, total: usize) {
        self.publish(
            ExecutionEventMessage::new(ExecutionEventType::ExecutionProgress, execution_id)
                .with_payload(json!({ "completedNodes": completed, "totalNodes": total })),
        )
        .await;
    }

    pub async fn execution_completed(&self, execution_id: &str, duration_ms: u64, executed_nodes: usize) {
        self.publish(
            ExecutionEventMessage::new(ExecutionEventType::Completed, execution_id)
                .with_payload(json!({ "durationMs": duration_ms, "executedNodes": executed_nodes })),
        )
        .await;
    }

    pub async fn execution_failed(&self, execution_id: &str, error: &str, node_id: Option<&str>) {
        let mut event = ExecutionEventMessage::new(ExecutionEventType::Failed, execution_id)
            .with_payload(json!({ "error": error }));
        event.node_id = node_id.map(str::to_string);
        self.publish(event).await;
    }

    pub async fn execution_cancelled(&self, execution_id: &str, stopped_before: Option<&str>) {
        self.publish(
            ExecutionEventMessage::new(ExecutionEventType::Cancelled, execution_id)
                .with_payload(json!({ "stoppedBefore": stopped_before })),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::bus::{EventBusError, EventReceiver, NativeEventBus};
    use async_trait::async_trait;

    struct BrokenBus;

    #[async_trait]
    impl EventBus for BrokenBus {
        async fn publish(&self, _payload: String) -> Result<(), EventBusError> {
            Err(EventBusError::Connection("refused".to_string()))
        }

        fn subscribe(&self) -> Box<dyn EventReceiver> {
            NativeEventBus::new().subscribe()
        }
    }

    #[tokio::test]
    async fn test_published_events_validate_on_the_other_side() {
        let bus = Arc::new(NativeEventBus::new());
        let mut receiver = bus.subscribe();
        let publisher = ExecutionEventPublisher::new(bus);

        publisher.node_started("e1", "a", "set").await;
        publisher.execution_failed("e1", "boom", Some("a")).await;

        let started = ExecutionEventMessage::parse(&receiver.recv().await.unwrap()).unwrap();
        assert_eq!(started.event_type, ExecutionEventType::NodeStarted);
        assert_eq!(started.node_id.as_deref(), Some("a"));

        let failed = ExecutionEventMessage::parse(&receiver.recv().await.unwrap()).unwrap();
        assert_eq!(failed.event_type, ExecutionEventType::Failed);
        assert_eq!(failed.payload.unwrap()["error"], "boom");
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let publisher = ExecutionEventPublisher::new(Arc::new(BrokenBus));
        publisher.execution_progress("e1", 1, 3).await;
    }
}
