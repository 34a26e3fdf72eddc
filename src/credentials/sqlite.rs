/// SQLite credential metadata lookup
///
/// Reads only the id, type and owner of a credential. Encrypted secret
/// material may live in the same table but is never selected here.

use crate::credentials::{CredentialLookup, CredentialRecord};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};

/// Credential lookup over the `credentials` table
#[derive(Debug, Clone)]
pub struct SqliteCredentialLookup {
    pool: SqlitePool,
}

impl SqliteCredentialLookup {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the credentials table if missing
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                credential_type TEXT NOT NULL,
                user_id TEXT NOT NULL,
                name TEXT,
                data TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_credentials_user
            ON credentials(user_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace credential metadata
    pub async fn upsert(&self, id: &str, credential_type: &str, user_id: &str, name: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (id, credential_type, user_id, name)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                credential_type = excluded.credential_type,
                user_id = excluded.user_id,
                name = excluded.name
            "#,
        )
        .bind(id)
        .bind(credential_type)
        .bind(user_id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CredentialLookup for SqliteCredentialLookup {
    async fn lookup(&self, credential_id: &str) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query("SELECT credential_type, user_id FROM credentials WHERE id = ?")
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| CredentialRecord {
            credential_type: row.get("credential_type"),
            owner_user_id: row.get("user_id"),
        }))
    }
}
