//! Environment data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use flotilla_protocol::AgentHello;

/// How the server reaches an environment's Docker engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EnvironmentKind {
    /// Remote engine behind an agent tunnel. The agent dials in.
    Agent,
    /// Engine reachable on a local UNIX socket.
    Local,
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentKind::Agent => write!(f, "agent"),
            EnvironmentKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for EnvironmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agent" => Ok(EnvironmentKind::Agent),
            "local" => Ok(EnvironmentKind::Local),
            _ => Err(format!("unknown environment kind: {}", s)),
        }
    }
}

/// A managed Docker environment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Environment {
    /// Unique environment ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// How the engine is reached.
    pub kind: EnvironmentKind,
    /// Engine socket path (local environments only).
    pub docker_socket: Option<String>,
    /// Agent-reported identity, refreshed on every handshake.
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub agent_version: Option<String>,
    pub docker_version: Option<String>,
    pub hostname: Option<String>,
    /// Capability list as a JSON array string.
    pub capabilities: Option<String>,
    /// Last time an agent for this environment was seen.
    pub last_seen_at: Option<String>,
    pub created_at: String,
}

/// Request to register a new environment.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEnvironmentRequest {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: EnvironmentKind,
    /// Socket path for local environments. Defaults to the engine socket
    /// from server config when omitted.
    #[serde(default)]
    pub docker_socket: Option<String>,
}

fn default_kind() -> EnvironmentKind {
    EnvironmentKind::Agent
}

/// Identity an agent presents during the tunnel handshake, minus the
/// bearer token.
#[derive(Debug, Clone, Serialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_name: String,
    pub version: String,
    pub docker_version: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
}

impl From<&AgentHello> for AgentIdentity {
    fn from(hello: &AgentHello) -> Self {
        Self {
            agent_id: hello.agent_id.clone(),
            agent_name: hello.agent_name.clone(),
            version: hello.version.clone(),
            docker_version: hello.docker_version.clone(),
            hostname: hello.hostname.clone(),
            capabilities: hello.capabilities.clone(),
        }
    }
}
