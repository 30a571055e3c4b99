//! Token database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::instrument;

use super::models::AgentToken;

const TOKEN_COLUMNS: &str =
    "id, secret_hash, label, environment_id, active, last_used_at, expires_at, created_at";

/// Repository for agent token persistence.
#[derive(Debug, Clone)]
pub struct TokenRepository {
    pool: SqlitePool,
}

impl TokenRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a freshly issued token record.
    #[instrument(skip(self, secret_hash))]
    pub async fn insert(
        &self,
        id: &str,
        secret_hash: &str,
        label: &str,
        environment_id: &str,
        expires_at: Option<&str>,
    ) -> Result<AgentToken> {
        sqlx::query(
            r#"
            INSERT INTO agent_tokens (id, secret_hash, label, environment_id, expires_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(secret_hash)
        .bind(label)
        .bind(environment_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("inserting agent token")?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Token not found after creation"))
    }

    /// Get a token by ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<AgentToken>> {
        let token = sqlx::query_as::<_, AgentToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM agent_tokens WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching agent token")?;

        Ok(token)
    }

    /// Get a token that is active and unexpired, by ID.
    #[instrument(skip(self))]
    pub async fn get_usable(&self, id: &str) -> Result<Option<AgentToken>> {
        let token = sqlx::query_as::<_, AgentToken>(&format!(
            r#"
            SELECT {TOKEN_COLUMNS} FROM agent_tokens
            WHERE id = ? AND active = 1
              AND (expires_at IS NULL OR expires_at > datetime('now'))
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching usable agent token")?;

        Ok(token)
    }

    /// List tokens, optionally scoped to one environment.
    #[instrument(skip(self))]
    pub async fn list(&self, environment_id: Option<&str>) -> Result<Vec<AgentToken>> {
        let tokens = match environment_id {
            Some(env_id) => {
                sqlx::query_as::<_, AgentToken>(&format!(
                    "SELECT {TOKEN_COLUMNS} FROM agent_tokens WHERE environment_id = ? \
                     ORDER BY created_at DESC, id DESC"
                ))
                .bind(env_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, AgentToken>(&format!(
                    "SELECT {TOKEN_COLUMNS} FROM agent_tokens ORDER BY created_at DESC, id DESC"
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("listing agent tokens")?;

        Ok(tokens)
    }

    /// Mark a token revoked.
    #[instrument(skip(self))]
    pub async fn revoke(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE agent_tokens SET active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("revoking agent token")?;

        Ok(result.rows_affected() > 0)
    }

    /// Stamp last-used. Best-effort from the caller's point of view.
    #[instrument(skip(self))]
    pub async fn touch_last_used(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE agent_tokens SET last_used_at = datetime('now') WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating token last-used timestamp")?;

        Ok(())
    }
}
