/// SQLite persistence layer for execution history
///
/// One row per execution plus one row per node result. Node outputs and
/// error details are stored as JSON text; timestamps as RFC 3339 strings.

use crate::history::{ExecutionHistory, ExecutionRecord, NodeExecutionRecord};
use crate::state::ExecutionStatus;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};

/// SQLite-based execution history
#[derive(Debug, Clone)]
pub struct SqliteExecutionHistory {
    /// SQLite connection pool for the history database
    pool: SqlitePool,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| anyhow::anyhow!("Invalid timestamp '{}': {}", raw, e))
}

impl SqliteExecutionHistory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the history schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                error JSON,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                saved_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_executions (
                execution_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                node_name TEXT NOT NULL,
                output JSON NOT NULL,
                PRIMARY KEY (execution_id, node_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Workflow-level listing
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_executions_workflow
            ON executions(workflow_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ExecutionHistory for SqliteExecutionHistory {
    /// Upsert the execution row and replace its node rows atomically
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let error_json = record.error.as_ref().map(serde_json::to_string).transpose()?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, user_id, status, error, started_at, finished_at, saved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                error = excluded.error,
                finished_at = excluded.finished_at,
                saved_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&record.execution_id)
        .bind(&record.workflow_id)
        .bind(&record.user_id)
        .bind(record.status.as_str())
        .bind(error_json)
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.map(|ts| ts.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM node_executions WHERE execution_id = ?")
            .bind(&record.execution_id)
            .execute(&mut *tx)
            .await?;

        for (position, node) in record.nodes.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO node_executions (execution_id, position, node_id, node_name, output)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.execution_id)
            .bind(position as i64)
            .bind(&node.node_id)
            .bind(&node.node_name)
            .bind(serde_json::to_string(&node.output)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(
            "💾 Saved execution {} ({}) with {} node results",
            record.execution_id,
            record.status,
            record.nodes.len()
        );
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(
            "SELECT workflow_id, user_id, status, error, started_at, finished_at FROM executions WHERE id = ?",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let error: Option<String> = row.get("error");
        let started_at: String = row.get("started_at");
        let finished_at: Option<String> = row.get("finished_at");

        let node_rows = sqlx::query(
            "SELECT node_id, node_name, output FROM node_executions WHERE execution_id = ? ORDER BY position",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        let mut nodes = Vec::with_capacity(node_rows.len());
        for node_row in node_rows {
            let output: String = node_row.get("output");
            nodes.push(NodeExecutionRecord {
                node_id: node_row.get("node_id"),
                node_name: node_row.get("node_name"),
                output: serde_json::from_str(&output)?,
            });
        }

        Ok(Some(ExecutionRecord {
            execution_id: execution_id.to_string(),
            workflow_id: row.get("workflow_id"),
            user_id: row.get("user_id"),
            status: status.parse::<ExecutionStatus>()?,
            started_at: parse_timestamp(&started_at)?,
            finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
            error: error.as_deref().map(serde_json::from_str).transpose()?,
            nodes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExecutionErrorInfo;
    use serde_json::json;

    async fn history() -> SqliteExecutionHistory {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let history = SqliteExecutionHistory::new(pool);
        history.init_schema().await.unwrap();
        history
    }

    fn record(status: ExecutionStatus, nodes: &[(&str, serde_json::Value)]) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: "e1".to_string(),
            workflow_id: "wf".to_string(),
            user_id: "u1".to_string(),
            status,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            error: None,
            nodes: nodes
                .iter()
                .map(|(id, output)| NodeExecutionRecord {
                    node_id: id.to_string(),
                    node_name: id.to_uppercase(),
                    output: output.clone(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let history = history().await;
        let saved = record(ExecutionStatus::Completed, &[("b", json!([1])), ("a", json!({"x": 2}))]);
        history.save_execution(&saved).await.unwrap();

        let loaded = history.get_execution("e1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.nodes, saved.nodes);
        assert!(history.get_execution("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_record() {
        let history = history().await;
        history
            .save_execution(&record(ExecutionStatus::Completed, &[("a", json!([1])), ("b", json!([2]))]))
            .await
            .unwrap();

        let mut failed = record(ExecutionStatus::Failed, &[("a", json!([1]))]);
        failed.error = Some(ExecutionErrorInfo {
            message: "boom".to_string(),
            code: "NODE_EXECUTION_ERROR".to_string(),
            node_id: Some("b".to_string()),
        });
        history.save_execution(&failed).await.unwrap();

        let loaded = history.get_execution("e1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(loaded.error.unwrap().node_id.as_deref(), Some("b"));
    }
}
