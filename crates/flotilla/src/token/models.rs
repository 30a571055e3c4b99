//! Token data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A persisted agent token record.
///
/// `secret_hash` never leaves the process: it is skipped on
/// serialization so the record can be returned from list/issue
/// endpoints as-is.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentToken {
    /// Token ID; also embedded in the raw token for O(1) lookup.
    pub id: String,
    /// bcrypt hash of the secret half of the raw token.
    #[serde(skip_serializing)]
    pub secret_hash: String,
    /// Human label ("prod-edge-01 agent").
    pub label: String,
    /// Environment this token authenticates for.
    pub environment_id: String,
    /// Revoked tokens stay on record with active = false.
    pub active: bool,
    pub last_used_at: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
}

/// Result of the issuance flow. The only place the raw token exists.
#[derive(Debug, Serialize)]
pub struct IssuedToken {
    #[serde(flatten)]
    pub record: AgentToken,
    /// `fta_<id>.<secret>`. Shown once, never recoverable.
    pub token: String,
}

/// Outcome of validating a presented token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValidation {
    Valid {
        token_id: String,
        environment_id: String,
    },
    Invalid,
}

impl TokenValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenValidation::Valid { .. })
    }
}
