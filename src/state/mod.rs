/// Live Execution State Layer
///
/// The state store is the single source of live truth shared by every worker
/// process. It holds, per execution id:
/// - Status and the node currently running
/// - Every node output recorded so far (append-only within an attempt)
/// - The resume checkpoint (last completed node)
///
/// Entries are TTL-bounded. Durable history lives elsewhere.

// In-process store (single worker process, tests)
pub mod memory;

// Redis-backed store shared across worker processes
#[cfg(feature = "redis")]
pub mod redis_store;

// Periodic reclamation of expired in-process entries
pub mod reclaim;

use crate::error::StateStoreError;
use crate::workflow::types::ExecutionJob;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub use memory::InMemoryStateStore;
pub use reclaim::spawn_reclaimer;
#[cfg(feature = "redis")]
pub use redis_store::RedisStateStore;

/// Result alias for state store operations
pub type StoreResult<T> = std::result::Result<T, StateStoreError>;

/// Lifecycle status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Completed, failed and cancelled are final
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` keeps the status monotonic
    ///
    /// Re-applying the current status is always accepted so every store
    /// operation stays idempotent. Paused executions may resume running.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        if self == next {
            return true;
        }
        match self {
            Pending => next != Pending,
            Running => matches!(next, Paused | Completed | Failed | Cancelled),
            Paused => matches!(next, Running | Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = StateStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(StateStoreError::Corrupt(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// Error captured when an execution ends in `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionErrorInfo {
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Live state of one execution, keyed by execution id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueExecutionContext {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub node_outputs: HashMap<String, Value>,
    #[serde(default)]
    pub last_completed_node_id: Option<String>,
    pub save_to_database: bool,
    pub user_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub node_id_to_name: HashMap<String, String>,
    #[serde(default)]
    pub trigger_data: Option<Value>,
    #[serde(default)]
    pub error: Option<ExecutionErrorInfo>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once the terminal outcome has been published and persisted
    #[serde(default)]
    pub finalized: bool,
}

impl QueueExecutionContext {
    /// Fresh pending state for the first attempt of a job
    pub fn from_job(job: &ExecutionJob) -> Self {
        Self {
            status: ExecutionStatus::Pending,
            current_node_id: None,
            node_outputs: HashMap::new(),
            last_completed_node_id: None,
            save_to_database: job.options.save_to_database,
            user_id: job.user_id.clone(),
            workflow_id: job.workflow_id.clone(),
            node_id_to_name: job.node_id_to_name(),
            trigger_data: job.trigger_data.clone(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            finalized: false,
        }
    }
}

/// Low-latency, TTL-bounded, key-per-execution store
///
/// Every operation is idempotent. Errors are infrastructure errors and are
/// surfaced to the worker, which fails the attempt rather than losing
/// checkpoint fidelity.
#[async_trait]
pub trait ExecutionStateStore: Send + Sync + 'static {
    /// Prepare the backend (connectivity check, scripts)
    async fn initialize(&self) -> StoreResult<()>;

    /// Create the state for an execution unless it already exists
    ///
    /// Returns `true` when a new entry was written.
    async fn create_state(&self, execution_id: &str, context: QueueExecutionContext) -> StoreResult<bool>;

    /// Full live state, or `None` when missing or expired
    async fn get_state(&self, execution_id: &str) -> StoreResult<Option<QueueExecutionContext>>;

    /// Move to `status` if the transition is monotonic
    ///
    /// Returns `false` when the transition was rejected (e.g. the execution is
    /// already terminal). Terminal statuses also stamp `finished_at`.
    async fn update_status(&self, execution_id: &str, status: ExecutionStatus) -> StoreResult<bool>;

    async fn update_current_node(&self, execution_id: &str, node_id: &str) -> StoreResult<()>;

    /// Record a node output without overwriting an existing one
    ///
    /// Returns `false` when the node already had an output.
    async fn set_node_output(&self, execution_id: &str, node_id: &str, data: &Value) -> StoreResult<bool>;

    async fn get_all_node_outputs(&self, execution_id: &str) -> StoreResult<HashMap<String, Value>>;

    /// Advance the resume checkpoint
    async fn update_last_completed_node(&self, execution_id: &str, node_id: &str) -> StoreResult<()>;

    async fn set_error(&self, execution_id: &str, error: &ExecutionErrorInfo) -> StoreResult<()>;

    /// Shorten the entry's lifetime to the completion retention window
    async fn set_completion_ttl(&self, execution_id: &str) -> StoreResult<()>;

    /// Claim the right to publish the terminal outcome
    ///
    /// Returns `true` for exactly one caller per execution; every later call
    /// returns `false`.
    async fn claim_finalization(&self, execution_id: &str) -> StoreResult<bool>;

    /// Drop entries whose TTL elapsed, returning how many were removed
    ///
    /// Backends with native key expiry have nothing to do.
    async fn purge_expired(&self) -> StoreResult<usize> {
        Ok(0)
    }
}
