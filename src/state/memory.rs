/// In-process execution state store
///
/// Keeps every execution in a map guarded by a tokio `RwLock`, with a
/// per-entry deadline standing in for Redis key expiry. Suitable for a single
/// worker process and for tests; a restart loses every checkpoint.

use crate::error::StateStoreError;
use crate::state::{
    ExecutionErrorInfo, ExecutionStateStore, ExecutionStatus, QueueExecutionContext, StoreResult,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

struct Entry {
    context: QueueExecutionContext,
    expires_at: Instant,
}

/// TTL-bounded in-memory state store
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, Entry>>,
    active_ttl: Duration,
    completion_ttl: Duration,
}

impl InMemoryStateStore {
    /// Create a store with the TTL for live entries and the shorter retention
    /// window applied once an execution is terminal
    pub fn new(active_ttl: Duration, completion_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            active_ttl,
            completion_ttl,
        }
    }

    /// Entries currently held, expired ones included until purged
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Run `f` against a live entry, treating an expired entry as missing
    async fn with_entry<T>(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> StoreResult<T> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if entries
            .get(execution_id)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            entries.remove(execution_id);
        }

        entries
            .get_mut(execution_id)
            .map(f)
            .ok_or_else(|| StateStoreError::NotFound(execution_id.to_string()))
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), Duration::from_secs(60 * 60))
    }
}

#[async_trait]
impl ExecutionStateStore for InMemoryStateStore {
    async fn initialize(&self) -> StoreResult<()> {
        tracing::debug!("🗄️ In-memory state store ready (active TTL {:?})", self.active_ttl);
        Ok(())
    }

    async fn create_state(&self, execution_id: &str, context: QueueExecutionContext) -> StoreResult<bool> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if let Some(existing) = entries.get(execution_id) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(
            execution_id.to_string(),
            Entry {
                context,
                expires_at: now + self.active_ttl,
            },
        );
        Ok(true)
    }

    async fn get_state(&self, execution_id: &str) -> StoreResult<Option<QueueExecutionContext>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(execution_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.context.clone()))
    }

    async fn update_status(&self, execution_id: &str, status: ExecutionStatus) -> StoreResult<bool> {
        self.with_entry(execution_id, |entry| {
            let current = entry.context.status;
            if !current.can_transition_to(status) {
                tracing::warn!(
                    "⚠️ Rejected status transition {} -> {} for execution {}",
                    current,
                    status,
                    execution_id
                );
                return false;
            }
            if current != status {
                entry.context.status = status;
                if status.is_terminal() {
                    entry.context.finished_at = Some(chrono::Utc::now());
                }
            }
            true
        })
        .await
    }

    async fn update_current_node(&self, execution_id: &str, node_id: &str) -> StoreResult<()> {
        self.with_entry(execution_id, |entry| {
            entry.context.current_node_id = Some(node_id.to_string());
        })
        .await
    }

    async fn set_node_output(&self, execution_id: &str, node_id: &str, data: &Value) -> StoreResult<bool> {
        self.with_entry(execution_id, |entry| {
            if entry.context.node_outputs.contains_key(node_id) {
                return false;
            }
            entry
                .context
                .node_outputs
                .insert(node_id.to_string(), data.clone());
            true
        })
        .await
    }

    async fn get_all_node_outputs(&self, execution_id: &str) -> StoreResult<HashMap<String, Value>> {
        Ok(self
            .get_state(execution_id)
            .await?
            .map(|context| context.node_outputs)
            .unwrap_or_default())
    }

    async fn update_last_completed_node(&self, execution_id: &str, node_id: &str) -> StoreResult<()> {
        self.with_entry(execution_id, |entry| {
            entry.context.last_completed_node_id = Some(node_id.to_string());
        })
        .await
    }

    async fn set_error(&self, execution_id: &str, error: &ExecutionErrorInfo) -> StoreResult<()> {
        self.with_entry(execution_id, |entry| {
            entry.context.error = Some(error.clone());
        })
        .await
    }

    async fn set_completion_ttl(&self, execution_id: &str) -> StoreResult<()> {
        let completion_ttl = self.completion_ttl;
        self.with_entry(execution_id, |entry| {
            entry.expires_at = Instant::now() + completion_ttl;
        })
        .await
    }

    async fn claim_finalization(&self, execution_id: &str) -> StoreResult<bool> {
        self.with_entry(execution_id, |entry| !std::mem::replace(&mut entry.context.finalized, true))
            .await
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn context() -> QueueExecutionContext {
        QueueExecutionContext {
            status: ExecutionStatus::Pending,
            current_node_id: None,
            node_outputs: HashMap::new(),
            last_completed_node_id: None,
            save_to_database: false,
            user_id: "user-1".to_string(),
            workflow_id: "wf-1".to_string(),
            node_id_to_name: HashMap::new(),
            trigger_data: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            finalized: false,
        }
    }

    fn store() -> InMemoryStateStore {
        InMemoryStateStore::new(Duration::from_secs(600), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = store();
        assert!(store.create_state("e1", context()).await.unwrap());

        let mut second = context();
        second.user_id = "someone-else".to_string();
        assert!(!store.create_state("e1", second).await.unwrap());

        let state = store.get_state("e1").await.unwrap().unwrap();
        assert_eq!(state.user_id, "user-1");
    }

    #[tokio::test]
    async fn test_node_outputs_are_append_only() {
        let store = store();
        store.create_state("e1", context()).await.unwrap();

        assert!(store.set_node_output("e1", "a", &json!([1])).await.unwrap());
        assert!(!store.set_node_output("e1", "a", &json!([2])).await.unwrap());
        store.set_node_output("e1", "b", &json!([3])).await.unwrap();

        let outputs = store.get_all_node_outputs("e1").await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs["a"], json!([1]));
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let store = store();
        store.create_state("e1", context()).await.unwrap();

        assert!(store.update_status("e1", ExecutionStatus::Running).await.unwrap());
        assert!(store.update_status("e1", ExecutionStatus::Completed).await.unwrap());
        assert!(!store.update_status("e1", ExecutionStatus::Running).await.unwrap());
        assert!(!store.update_status("e1", ExecutionStatus::Failed).await.unwrap());

        let state = store.get_state("e1").await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert!(state.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_execution_is_not_found() {
        let store = store();
        assert!(store.get_state("nope").await.unwrap().is_none());
        assert!(store.get_all_node_outputs("nope").await.unwrap().is_empty());

        let err = store.update_current_node("nope", "a").await.unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(id) if id == "nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_ttl_expires_state() {
        let store = store();
        store.create_state("e1", context()).await.unwrap();
        store.update_last_completed_node("e1", "a").await.unwrap();
        store.set_completion_ttl("e1").await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        let state = store.get_state("e1").await.unwrap().unwrap();
        assert_eq!(state.last_completed_node_id.as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get_state("e1").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finalization_is_claimed_once() {
        let store = store();
        store.create_state("e1", context()).await.unwrap();

        assert!(store.claim_finalization("e1").await.unwrap());
        assert!(!store.claim_finalization("e1").await.unwrap());
        assert!(store.get_state("e1").await.unwrap().unwrap().finalized);
        assert!(matches!(
            store.claim_finalization("nope").await.unwrap_err(),
            StateStoreError::NotFound(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_can_be_recreated() {
        let store = store();
        store.create_state("e1", context()).await.unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;

        assert!(store.create_state("e1", context()).await.unwrap());
    }
}
