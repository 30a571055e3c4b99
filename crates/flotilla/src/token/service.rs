//! Token authority: issuance and handshake validation.

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use tracing::{info, instrument, warn};

use super::models::{AgentToken, IssuedToken, TokenValidation};
use super::repository::TokenRepository;

/// Raw token prefix. Full form: `fta_<token-id>.<secret>`.
const TOKEN_PREFIX: &str = "fta_";

/// Length of the random secret in bytes (43 base64 chars).
const SECRET_LEN: usize = 32;

/// Service for issuing and validating agent tokens.
#[derive(Debug, Clone)]
pub struct TokenService {
    repo: TokenRepository,
}

impl TokenService {
    /// Create a new token service.
    pub fn new(repo: TokenRepository) -> Self {
        Self { repo }
    }

    /// Issue a token bound to an environment.
    ///
    /// The returned [`IssuedToken`] carries the raw token; it is not
    /// stored and cannot be recovered later.
    #[instrument(skip(self), fields(environment_id = %environment_id))]
    pub async fn issue(
        &self,
        environment_id: &str,
        label: &str,
        expires_in_secs: Option<i64>,
    ) -> Result<IssuedToken> {
        if label.trim().is_empty() {
            bail!("Token label cannot be empty.");
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let secret = generate_secret();
        let secret_hash =
            bcrypt::hash(&secret, bcrypt::DEFAULT_COST).context("hashing token secret")?;

        let expires_at = expires_in_secs.map(|secs| {
            let expiry = chrono::Utc::now() + chrono::Duration::seconds(secs);
            expiry.format("%Y-%m-%d %H:%M:%S").to_string()
        });

        let record = self
            .repo
            .insert(&id, &secret_hash, label, environment_id, expires_at.as_deref())
            .await?;

        info!(token_id = %record.id, environment_id = %environment_id, "Issued agent token");

        Ok(IssuedToken {
            token: format!("{TOKEN_PREFIX}{id}.{secret}"),
            record,
        })
    }

    /// Validate a token presented in an agent handshake.
    ///
    /// Never returns the reason a token was rejected: a bad id, a
    /// revoked record and a wrong secret are indistinguishable to the
    /// caller. On success the last-used timestamp is updated
    /// best-effort.
    #[instrument(skip_all)]
    pub async fn validate(&self, raw: &str) -> Result<TokenValidation> {
        let Some((id, secret)) = parse_raw_token(raw) else {
            return Ok(TokenValidation::Invalid);
        };

        let Some(record) = self.repo.get_usable(id).await? else {
            return Ok(TokenValidation::Invalid);
        };

        let verified =
            bcrypt::verify(secret, &record.secret_hash).context("verifying token secret")?;
        if !verified {
            warn!(token_id = %record.id, "Token secret mismatch");
            return Ok(TokenValidation::Invalid);
        }

        if let Err(e) = self.repo.touch_last_used(&record.id).await {
            warn!(token_id = %record.id, "Failed to update token last-used: {e:?}");
        }

        Ok(TokenValidation::Valid {
            token_id: record.id,
            environment_id: record.environment_id,
        })
    }

    /// List tokens, optionally for one environment.
    pub async fn list(&self, environment_id: Option<&str>) -> Result<Vec<AgentToken>> {
        self.repo.list(environment_id).await
    }

    /// Revoke a token. Idempotent once the token exists.
    #[instrument(skip(self))]
    pub async fn revoke(&self, id: &str) -> Result<bool> {
        let revoked = self.repo.revoke(id).await?;
        if revoked {
            info!(token_id = %id, "Revoked agent token");
        }
        Ok(revoked)
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Split `fta_<id>.<secret>` into its halves.
fn parse_raw_token(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix(TOKEN_PREFIX)?;
    let (id, secret) = rest.split_once('.')?;
    if id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((id, secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::environment::{CreateEnvironmentRequest, EnvironmentKind, EnvironmentRepository};

    async fn test_service() -> (TokenService, String) {
        let db = Database::in_memory().await.unwrap();
        let envs = EnvironmentRepository::new(db.pool().clone());
        let env = envs
            .create(CreateEnvironmentRequest {
                name: "edge".to_string(),
                kind: EnvironmentKind::Agent,
                docker_socket: None,
            })
            .await
            .unwrap();
        (TokenService::new(TokenRepository::new(db.pool().clone())), env.id)
    }

    #[test]
    fn test_parse_raw_token() {
        assert_eq!(parse_raw_token("fta_abc.xyz"), Some(("abc", "xyz")));
        assert_eq!(parse_raw_token("fta_abc."), None);
        assert_eq!(parse_raw_token("fta_.xyz"), None);
        assert_eq!(parse_raw_token("abc.xyz"), None);
        assert_eq!(parse_raw_token("fta_noseparator"), None);
    }

    #[tokio::test]
    async fn test_issue_then_validate() {
        let (service, env_id) = test_service().await;
        let issued = service.issue(&env_id, "edge agent", None).await.unwrap();

        // The raw secret is never stored.
        assert!(!issued.token.contains(&issued.record.secret_hash));
        assert!(issued.token.starts_with("fta_"));

        let validation = service.validate(&issued.token).await.unwrap();
        assert_eq!(
            validation,
            TokenValidation::Valid {
                token_id: issued.record.id.clone(),
                environment_id: env_id,
            }
        );

        // Validation stamped last-used.
        let tokens = service.list(None).await.unwrap();
        assert!(tokens[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_validate_rejects_wrong_secret() {
        let (service, env_id) = test_service().await;
        let issued = service.issue(&env_id, "edge agent", None).await.unwrap();

        let forged = format!("fta_{}.forged-secret", issued.record.id);
        assert_eq!(service.validate(&forged).await.unwrap(), TokenValidation::Invalid);
    }

    #[tokio::test]
    async fn test_validate_rejects_revoked() {
        let (service, env_id) = test_service().await;
        let issued = service.issue(&env_id, "edge agent", None).await.unwrap();

        assert!(service.revoke(&issued.record.id).await.unwrap());
        assert_eq!(service.validate(&issued.token).await.unwrap(), TokenValidation::Invalid);
    }

    #[tokio::test]
    async fn test_validate_rejects_expired() {
        let (service, env_id) = test_service().await;
        // Already a minute past expiry.
        let issued = service.issue(&env_id, "edge agent", Some(-60)).await.unwrap();

        assert_eq!(service.validate(&issued.token).await.unwrap(), TokenValidation::Invalid);
    }

    #[tokio::test]
    async fn test_validate_rejects_garbage() {
        let (service, _env_id) = test_service().await;
        assert_eq!(service.validate("not-a-token").await.unwrap(), TokenValidation::Invalid);
        assert_eq!(service.validate("").await.unwrap(), TokenValidation::Invalid);
    }
}
