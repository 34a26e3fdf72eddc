/// Redis execution state store (behind the `redis` feature)
///
/// Layout per execution:
/// - `{prefix}:execution:{id}`: hash of scalar fields (status, checkpoint, ...)
/// - `{prefix}:execution:{id}:outputs`: hash of node id -> JSON output
///
/// Both keys expire together. Status changes go through a compare-and-set
/// script so an external cancellation is never overwritten by a worker.

use crate::error::StateStoreError;
use crate::state::{
    ExecutionErrorInfo, ExecutionStateStore, ExecutionStatus, QueueExecutionContext, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Attempts for the status compare-and-set before giving up
const STATUS_CAS_ATTEMPTS: usize = 3;

const STATUS_CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return -1 end
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[2])
if ARGV[3] ~= '' then redis.call('HSET', KEYS[1], 'finishedAt', ARGV[3]) end
return 1
"#;

/// Write one field only while the state key is alive, so an expired entry is
/// never recreated without a TTL
const SET_FIELD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

const CLAIM_FINALIZATION_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
return redis.call('HSETNX', KEYS[1], 'finalized', 'true')
"#;

fn unavailable(e: redis::RedisError) -> StateStoreError {
    StateStoreError::Unavailable(e.to_string())
}

/// Redis-backed state store shared by every worker process
pub struct RedisStateStore {
    manager: ConnectionManager,
    key_prefix: String,
    active_ttl: Duration,
    completion_ttl: Duration,
    status_script: Script,
    set_field_script: Script,
    claim_script: Script,
}

impl RedisStateStore {
    /// Connect to Redis (the connection manager reconnects automatically)
    pub async fn connect(
        redis_url: &str,
        key_prefix: impl Into<String>,
        active_ttl: Duration,
        completion_ttl: Duration,
    ) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let manager = ConnectionManager::new(client).await.map_err(unavailable)?;
        tracing::info!("🔌 Redis state store connected: {}", redis_url);

        Ok(Self {
            manager,
            key_prefix: key_prefix.into(),
            active_ttl,
            completion_ttl,
            status_script: Script::new(STATUS_CAS_SCRIPT),
            set_field_script: Script::new(SET_FIELD_SCRIPT),
            claim_script: Script::new(CLAIM_FINALIZATION_SCRIPT),
        })
    }

    fn state_key(&self, execution_id: &str) -> String {
        format!("{}:execution:{}", self.key_prefix, execution_id)
    }

    fn outputs_key(&self, execution_id: &str) -> String {
        format!("{}:execution:{}:outputs", self.key_prefix, execution_id)
    }

    async fn set_field(&self, execution_id: &str, field: &str, value: String) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let outcome: i64 = self
            .set_field_script
            .key(self.state_key(execution_id))
            .arg(field)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if outcome < 0 {
            return Err(StateStoreError::NotFound(execution_id.to_string()));
        }
        Ok(())
    }

    fn encode(context: &QueueExecutionContext) -> StoreResult<Vec<(&'static str, String)>> {
        let mut fields = vec![
            ("status", context.status.as_str().to_string()),
            ("saveToDatabase", context.save_to_database.to_string()),
            ("userId", context.user_id.clone()),
            ("workflowId", context.workflow_id.clone()),
            ("nodeIdToName", serde_json::to_string(&context.node_id_to_name)?),
            ("startedAt", context.started_at.to_rfc3339()),
        ];
        if let Some(node_id) = &context.current_node_id {
            fields.push(("currentNodeId", node_id.clone()));
        }
        if let Some(node_id) = &context.last_completed_node_id {
            fields.push(("lastCompletedNodeId", node_id.clone()));
        }
        if let Some(trigger_data) = &context.trigger_data {
            fields.push(("triggerData", serde_json::to_string(trigger_data)?));
        }
        if let Some(error) = &context.error {
            fields.push(("error", serde_json::to_string(error)?));
        }
        if let Some(finished_at) = &context.finished_at {
            fields.push(("finishedAt", finished_at.to_rfc3339()));
        }
        if context.finalized {
            fields.push(("finalized", "true".to_string()));
        }
        Ok(fields)
    }

    fn decode(
        mut fields: HashMap<String, String>,
        node_outputs: HashMap<String, Value>,
    ) -> StoreResult<QueueExecutionContext> {
        let status = fields
            .remove("status")
            .ok_or_else(|| StateStoreError::Corrupt("missing status".to_string()))?
            .parse()?;
        let parse_time = |raw: Option<String>| -> StoreResult<Option<DateTime<Utc>>> {
            raw.map(|value| {
                DateTime::parse_from_rfc3339(&value)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| StateStoreError::Corrupt(format!("bad timestamp '{}': {}", value, e)))
            })
            .transpose()
        };

        Ok(QueueExecutionContext {
            status,
            current_node_id: fields.remove("currentNodeId"),
            node_outputs,
            last_completed_node_id: fields.remove("lastCompletedNodeId"),
            save_to_database: fields.remove("saveToDatabase").as_deref() == Some("true"),
            user_id: fields.remove("userId").unwrap_or_default(),
            workflow_id: fields.remove("workflowId").unwrap_or_default(),
            node_id_to_name: match fields.remove("nodeIdToName") {
                Some(raw) => serde_json::from_str(&raw)?,
                None => HashMap::new(),
            },
            trigger_data: fields
                .remove("triggerData")
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            error: fields
                .remove("error")
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            started_at: parse_time(fields.remove("startedAt"))?.unwrap_or_else(Utc::now),
            finished_at: parse_time(fields.remove("finishedAt"))?,
            finalized: fields.remove("finalized").as_deref() == Some("true"),
        })
    }
}

#[async_trait]
impl ExecutionStateStore for RedisStateStore {
    async fn initialize(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        tracing::info!("✅ Redis state store ready ({})", pong);
        Ok(())
    }

    async fn create_state(&self, execution_id: &str, context: QueueExecutionContext) -> StoreResult<bool> {
        let key = self.state_key(execution_id);
        let mut conn = self.manager.clone();

        let exists: bool = conn.exists(&key).await.map_err(unavailable)?;
        if exists {
            return Ok(false);
        }

        let fields = Self::encode(&context)?;
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.active_ttl.as_secs())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        for (node_id, data) in &context.node_outputs {
            self.set_node_output(execution_id, node_id, data).await?;
        }

        tracing::debug!("🆕 Created live state for execution {}", execution_id);
        Ok(true)
    }

    async fn get_state(&self, execution_id: &str) -> StoreResult<Option<QueueExecutionContext>> {
        let mut conn = self.manager.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.state_key(execution_id))
            .await
            .map_err(unavailable)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let outputs = self.get_all_node_outputs(execution_id).await?;
        Self::decode(fields, outputs).map(Some)
    }

    async fn update_status(&self, execution_id: &str, status: ExecutionStatus) -> StoreResult<bool> {
        let key = self.state_key(execution_id);

        for _ in 0..STATUS_CAS_ATTEMPTS {
            let mut conn = self.manager.clone();
            let current: Option<String> = conn.hget(&key, "status").await.map_err(unavailable)?;
            let current: ExecutionStatus = current
                .ok_or_else(|| StateStoreError::NotFound(execution_id.to_string()))?
                .parse()?;

            if !current.can_transition_to(status) {
                tracing::warn!(
                    "⚠️ Rejected status transition {} -> {} for execution {}",
                    current,
                    status,
                    execution_id
                );
                return Ok(false);
            }
            if current == status {
                return Ok(true);
            }

            let finished_at = if status.is_terminal() {
                Utc::now().to_rfc3339()
            } else {
                String::new()
            };
            let outcome: i64 = self
                .status_script
                .key(&key)
                .arg(current.as_str())
                .arg(status.as_str())
                .arg(finished_at)
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;

            match outcome {
                1 => return Ok(true),
                -1 => return Err(StateStoreError::NotFound(execution_id.to_string())),
                _ => continue,
            }
        }

        Err(StateStoreError::Unavailable(format!(
            "status of execution {} kept changing during update",
            execution_id
        )))
    }

    async fn update_current_node(&self, execution_id: &str, node_id: &str) -> StoreResult<()> {
        self.set_field(execution_id, "currentNodeId", node_id.to_string())
            .await
    }

    async fn set_node_output(&self, execution_id: &str, node_id: &str, data: &Value) -> StoreResult<bool> {
        let outputs_key = self.outputs_key(execution_id);
        let payload = serde_json::to_string(data)?;
        let mut conn = self.manager.clone();

        let (created, remaining_ms): (bool, i64) = redis::pipe()
            .hset_nx(&outputs_key, node_id, payload)
            .cmd("PTTL")
            .arg(self.state_key(execution_id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if remaining_ms > 0 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(&outputs_key)
                .arg(remaining_ms)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
        }

        Ok(created)
    }

    async fn get_all_node_outputs(&self, execution_id: &str) -> StoreResult<HashMap<String, Value>> {
        let mut conn = self.manager.clone();
        let raw: HashMap<String, String> = conn
            .hgetall(self.outputs_key(execution_id))
            .await
            .map_err(unavailable)?;

        raw.into_iter()
            .map(|(node_id, payload)| Ok((node_id, serde_json::from_str(&payload)?)))
            .collect()
    }

    async fn update_last_completed_node(&self, execution_id: &str, node_id: &str) -> StoreResult<()> {
        self.set_field(execution_id, "lastCompletedNodeId", node_id.to_string())
            .await
    }

    async fn set_error(&self, execution_id: &str, error: &ExecutionErrorInfo) -> StoreResult<()> {
        self.set_field(execution_id, "error", serde_json::to_string(error)?)
            .await
    }

    async fn set_completion_ttl(&self, execution_id: &str) -> StoreResult<()> {
        let secs = self.completion_ttl.as_secs();
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .cmd("EXPIRE")
            .arg(self.state_key(execution_id))
            .arg(secs)
            .ignore()
            .cmd("EXPIRE")
            .arg(self.outputs_key(execution_id))
            .arg(secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        tracing::debug!(
            "⏳ Execution {} retained for {:?} after completion",
            execution_id,
            self.completion_ttl
        );
        Ok(())
    }

    async fn claim_finalization(&self, execution_id: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let outcome: i64 = self
            .claim_script
            .key(self.state_key(execution_id))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match outcome {
            -1 => Err(StateStoreError::NotFound(execution_id.to_string())),
            claimed => Ok(claimed == 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_preserves_state() {
        let mut context = QueueExecutionContext {
            status: ExecutionStatus::Running,
            current_node_id: Some("b".to_string()),
            node_outputs: HashMap::new(),
            last_completed_node_id: Some("a".to_string()),
            save_to_database: true,
            user_id: "u1".to_string(),
            workflow_id: "wf".to_string(),
            node_id_to_name: HashMap::from([("a".to_string(), "Start".to_string())]),
            trigger_data: Some(json!({"x": 1})),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            finalized: true,
        };

        let fields: HashMap<String, String> = RedisStateStore::encode(&context)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let outputs = HashMap::from([("a".to_string(), json!([{"ok": true}]))]);
        let decoded = RedisStateStore::decode(fields, outputs.clone()).unwrap();

        context.node_outputs = outputs;
        context.started_at = decoded.started_at;
        assert_eq!(decoded, context);
    }

    #[test]
    fn test_decode_without_status_is_corrupt() {
        let err = RedisStateStore::decode(HashMap::new(), HashMap::new()).unwrap_err();
        assert!(matches!(err, StateStoreError::Corrupt(_)));
    }

    /// Runs against a live server named by `FLOWRUNNER_TEST_REDIS_URL`
    #[tokio::test]
    async fn test_field_update_does_not_revive_expired_state() {
        let Ok(url) = std::env::var("FLOWRUNNER_TEST_REDIS_URL") else {
            return;
        };
        let prefix = format!("flowrunner-test-{}", uuid::Uuid::new_v4());
        let store = RedisStateStore::connect(&url, prefix, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        let job: crate::workflow::types::ExecutionJob = serde_json::from_value(json!({
            "executionId": "e1",
            "workflowId": "wf",
            "userId": "u1",
            "nodes": [{"id": "a", "type": "set"}]
        }))
        .unwrap();
        store
            .create_state("e1", QueueExecutionContext::from_job(&job))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;

        let err = store.update_current_node("e1", "a").await.unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(_)));
        assert!(matches!(
            store.claim_finalization("e1").await,
            Err(StateStoreError::NotFound(_))
        ));
        // No partial hash was left behind
        assert!(store.get_state("e1").await.unwrap().is_none());
    }
}
