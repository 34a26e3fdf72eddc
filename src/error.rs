/// Error types for the execution engine
///
/// Node failures and infrastructure failures are kept apart so the worker can
/// decide what to surface to the queue. Application edges (server, main) use
/// `anyhow` and convert from these.

use std::time::Duration;
use thiserror::Error;

/// Result alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failures raised by an `ExecutionStateStore` implementation
///
/// Always an infrastructure problem, never a business error.
#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Execution state not found: {0}")]
    NotFound(String),

    #[error("Corrupt execution state: {0}")]
    Corrupt(String),

    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that fail an execution attempt
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Node '{node_id}' timed out after {timeout:?}")]
    NodeTimeout { node_id: String, timeout: Duration },

    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow contains a cycle involving nodes: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("Credential lookup failed: {0}")]
    Credential(String),

    #[error("Worker has no node executor; call initialize() first")]
    NotInitialized,
}

impl EngineError {
    /// Node the error is attributed to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            EngineError::NodeExecution { node_id, .. } | EngineError::NodeTimeout { node_id, .. } => {
                Some(node_id)
            }
            _ => None,
        }
    }

    /// Stable error code recorded in live state and history
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NodeExecution { .. } => "NODE_EXECUTION_ERROR",
            EngineError::NodeTimeout { .. } => "NODE_TIMEOUT",
            EngineError::StateStore(_) => "STATE_STORE_UNAVAILABLE",
            EngineError::InvalidWorkflow(_) => "INVALID_WORKFLOW",
            EngineError::CycleDetected(_) => "CYCLE_DETECTED",
            EngineError::Credential(_) => "CREDENTIAL_ERROR",
            EngineError::NotInitialized => "NOT_INITIALIZED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_errors_carry_node_id() {
        let err = EngineError::NodeExecution {
            node_id: "b".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.node_id(), Some("b"));
        assert_eq!(err.code(), "NODE_EXECUTION_ERROR");
        assert_eq!(err.to_string(), "Node 'b' failed: boom");

        let store: EngineError = StateStoreError::Unavailable("down".to_string()).into();
        assert_eq!(store.node_id(), None);
        assert_eq!(store.code(), "STATE_STORE_UNAVAILABLE");
    }

    #[test]
    fn test_cycle_message_lists_nodes() {
        let err = EngineError::CycleDetected(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "Workflow contains a cycle involving nodes: a, b");
    }
}
