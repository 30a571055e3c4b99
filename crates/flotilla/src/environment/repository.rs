//! Environment database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{AgentIdentity, CreateEnvironmentRequest, Environment};

const ENVIRONMENT_COLUMNS: &str = "id, name, kind, docker_socket, agent_id, agent_name, \
     agent_version, docker_version, hostname, capabilities, last_seen_at, created_at";

/// Repository for environment persistence.
#[derive(Debug, Clone)]
pub struct EnvironmentRepository {
    pool: SqlitePool,
}

impl EnvironmentRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn generate_id() -> String {
        format!("env_{}", uuid::Uuid::new_v4().simple())
    }

    /// Create a new environment.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(&self, request: CreateEnvironmentRequest) -> Result<Environment> {
        let id = Self::generate_id();

        debug!("Creating environment {} ({})", request.name, id);

        sqlx::query(
            r#"
            INSERT INTO environments (id, name, kind, docker_socket)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&request.name)
        .bind(request.kind.to_string())
        .bind(&request.docker_socket)
        .execute(&self.pool)
        .await
        .context("creating environment")?;

        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Environment not found after creation"))
    }

    /// Get an environment by ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<Environment>> {
        let env = sqlx::query_as::<_, Environment>(&format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching environment")?;

        Ok(env)
    }

    /// List all environments, newest first.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<Environment>> {
        let envs = sqlx::query_as::<_, Environment>(&format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing environments")?;

        Ok(envs)
    }

    /// Delete an environment. Tokens bound to it go with it.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM environments WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting environment")?;

        Ok(result.rows_affected() > 0)
    }

    /// Store the identity an agent presented at handshake and stamp
    /// last-seen.
    #[instrument(skip(self, identity))]
    pub async fn update_agent_identity(&self, id: &str, identity: &AgentIdentity) -> Result<()> {
        let capabilities = serde_json::to_string(&identity.capabilities)
            .context("serializing agent capabilities")?;

        sqlx::query(
            r#"
            UPDATE environments
            SET agent_id = ?, agent_name = ?, agent_version = ?,
                docker_version = ?, hostname = ?, capabilities = ?,
                last_seen_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(&identity.agent_id)
        .bind(&identity.agent_name)
        .bind(&identity.version)
        .bind(&identity.docker_version)
        .bind(&identity.hostname)
        .bind(&capabilities)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating agent identity")?;

        Ok(())
    }

    /// Stamp last-seen for an environment (on disconnect).
    #[instrument(skip(self))]
    pub async fn touch_last_seen(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE environments SET last_seen_at = datetime('now') WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating last-seen timestamp")?;

        Ok(())
    }
}
