/// Durable execution history
///
/// Finished executions whose job asked for `saveToDatabase` are handed to an
/// `ExecutionHistory` once they reach a terminal status. Live state stays in
/// the state store and expires; history is the long-term record.

// SQLite-backed history
pub mod sqlite;

pub use sqlite::SqliteExecutionHistory;

use crate::state::{ExecutionErrorInfo, ExecutionStatus, QueueExecutionContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output of one node within a recorded execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub node_name: String,
    pub output: Value,
}

/// Terminal snapshot of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<ExecutionErrorInfo>,
    /// Node results in execution order
    pub nodes: Vec<NodeExecutionRecord>,
}

impl ExecutionRecord {
    /// Snapshot live state; `order` is the plan the attempt walked
    pub fn from_state(execution_id: &str, state: &QueueExecutionContext, order: &[String]) -> Self {
        let name_of = |node_id: &str| {
            state
                .node_id_to_name
                .get(node_id)
                .cloned()
                .unwrap_or_else(|| node_id.to_string())
        };

        let mut nodes: Vec<NodeExecutionRecord> = order
            .iter()
            .filter_map(|node_id| {
                state.node_outputs.get(node_id).map(|output| NodeExecutionRecord {
                    node_id: node_id.clone(),
                    node_name: name_of(node_id),
                    output: output.clone(),
                })
            })
            .collect();

        // Outputs outside the plan (earlier single-node runs) go last
        let mut extra: Vec<&String> = state
            .node_outputs
            .keys()
            .filter(|node_id| !order.contains(node_id))
            .collect();
        extra.sort();
        for node_id in extra {
            nodes.push(NodeExecutionRecord {
                node_id: node_id.clone(),
                node_name: name_of(node_id),
                output: state.node_outputs[node_id].clone(),
            });
        }

        Self {
            execution_id: execution_id.to_string(),
            workflow_id: state.workflow_id.clone(),
            user_id: state.user_id.clone(),
            status: state.status,
            started_at: state.started_at,
            finished_at: state.finished_at,
            error: state.error.clone(),
            nodes,
        }
    }
}

/// Long-term storage for finished executions
#[async_trait]
pub trait ExecutionHistory: Send + Sync + 'static {
    /// Insert or replace the record for an execution
    async fn save_execution(&self, record: &ExecutionRecord) -> anyhow::Result<()>;

    async fn get_execution(&self, execution_id: &str) -> anyhow::Result<Option<ExecutionRecord>>;
}
