/// Node executor contract
///
/// The engine never runs node logic itself. It hands a fully resolved
/// `NodeExecutionRequest` to a `NodeExecutor` and interprets the outcome:
/// - `success: true` records `data` as the node's output
/// - `success: false` (or a transport error) fails the node and the job
///
/// `HttpNodeExecutor` forwards requests to an external node runtime.

use crate::runtime::inputs::NodeInputs;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Everything a node needs to run once
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRequest {
    pub node_id: String,
    pub node_type: String,
    pub parameters: Value,
    pub input_data: NodeInputs,
    /// Credential type -> credential id
    pub credentials: HashMap<String, String>,
    pub execution_id: String,
    pub user_id: String,
    pub workflow_id: String,
    /// Budget for this invocation; the engine enforces it as well
    pub timeout_ms: u64,
    pub node_settings: Value,
    /// Outputs of every node completed so far in this execution
    pub node_outputs: HashMap<String, Value>,
    pub node_id_to_name: HashMap<String, String>,
}

impl NodeExecutionRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Result reported by a node executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeExecutionOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Executes the logic of a single node
///
/// An `Err` is a transport or infrastructure failure; the engine treats it
/// the same as a failed outcome.
#[async_trait]
pub trait NodeExecutor: Send + Sync + 'static {
    async fn execute(&self, request: NodeExecutionRequest) -> anyhow::Result<NodeExecutionOutcome>;
}

/// Node executor that POSTs requests to an external node runtime
///
/// Expected response body: `{ "success": bool, "data"?: any, "error"?: string }`
#[derive(Debug, Clone)]
pub struct HttpNodeExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNodeExecutor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl NodeExecutor for HttpNodeExecutor {
    async fn execute(&self, request: NodeExecutionRequest) -> anyhow::Result<NodeExecutionOutcome> {
        tracing::debug!(
            "🌐 Dispatching node '{}' ({}) to {}",
            request.node_id,
            request.node_type,
            self.endpoint
        );

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(request.timeout())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Node runtime request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Node runtime returned {} for node '{}': {}",
                status,
                request.node_id,
                body
            ));
        }

        response
            .json::<NodeExecutionOutcome>()
            .await
            .map_err(|e| anyhow::anyhow!("Invalid node runtime response: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_parses_runtime_response() {
        let ok: NodeExecutionOutcome =
            serde_json::from_value(json!({"success": true, "data": [{"a": 1}]})).unwrap();
        assert_eq!(ok, NodeExecutionOutcome::success(json!([{"a": 1}])));

        let failed: NodeExecutionOutcome =
            serde_json::from_value(json!({"success": false, "error": "bad input"})).unwrap();
        assert_eq!(failed, NodeExecutionOutcome::failure("bad input"));
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let request = NodeExecutionRequest {
            node_id: "a".to_string(),
            node_type: "set".to_string(),
            parameters: json!({}),
            input_data: NodeInputs::default(),
            credentials: HashMap::new(),
            execution_id: "e1".to_string(),
            user_id: "u1".to_string(),
            workflow_id: "wf".to_string(),
            timeout_ms: 1500,
            node_settings: json!({}),
            node_outputs: HashMap::new(),
            node_id_to_name: HashMap::new(),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["timeoutMs"], 1500);
        assert_eq!(value["nodeType"], "set");
        assert!(value.get("inputData").is_some());
        assert_eq!(request.timeout(), Duration::from_millis(1500));
    }
}
