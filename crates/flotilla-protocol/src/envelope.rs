//! Envelope and payload types.
//!
//! The envelope set is closed: anything that does not parse into a known
//! variant lands in [`Envelope::Unknown`] and is dropped by the dispatcher
//! without touching connection state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One message unit on the tunnel wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Agent handshake. First message on a new connection.
    Hello(AgentHello),

    /// Handshake accepted; the agent is now bound to an environment.
    Welcome {
        #[serde(rename = "environmentId")]
        environment_id: String,
    },

    /// Fatal handshake or protocol error, followed by a close.
    Error { message: String },

    /// Liveness probe. Either side may send one at any time.
    Ping { timestamp: i64 },

    /// Reply to a ping. Echoes the probe timestamp.
    Pong { timestamp: i64 },

    /// Unary or streaming engine-API call (server -> agent).
    Request(EngineRequest),

    /// The single reply to a unary [`Envelope::Request`].
    Response(EngineResponse),

    /// One chunk of a streaming reply.
    Stream(StreamChunk),

    /// Terminates a streaming reply. Exactly one per streaming call.
    StreamEnd {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        reason: String,
    },

    /// Tells the agent to stop producing data for a streaming call
    /// (server -> agent). The agent stops the underlying engine stream.
    StreamCancel {
        #[serde(rename = "requestId")]
        request_id: Uuid,
    },

    /// Open an interactive exec session inside a container (server -> agent).
    ExecStart(ExecStart),

    /// PTY allocated; the exec session is live (agent -> server).
    ExecReady {
        #[serde(rename = "execId")]
        exec_id: String,
    },

    /// Terminal output. `data` is base64 so binary escape sequences
    /// survive the JSON framing.
    ExecOutput {
        #[serde(rename = "execId")]
        exec_id: String,
        data: String,
    },

    /// Terminal input (server -> agent). Base64, same framing as output.
    ExecInput {
        #[serde(rename = "execId")]
        exec_id: String,
        data: String,
    },

    /// Terminal geometry change (server -> agent).
    ExecResize {
        #[serde(rename = "execId")]
        exec_id: String,
        cols: u16,
        rows: u16,
    },

    /// Either side closes the exec session.
    ExecEnd {
        #[serde(rename = "execId")]
        exec_id: String,
        reason: String,
    },

    /// Out-of-band push: a container changed state on the remote engine.
    ContainerEvent {
        action: String,
        #[serde(rename = "containerId")]
        container_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Value>,
    },

    /// Out-of-band push: periodic host/engine metrics snapshot.
    Metrics { data: Value },

    /// Catch-all for tags this build does not know. Logged and dropped.
    #[serde(other)]
    Unknown,
}

/// Agent identity presented during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHello {
    /// Bearer token issued for one environment. Never logged.
    pub token: String,
    pub agent_id: String,
    pub agent_name: String,
    pub version: String,
    pub docker_version: String,
    pub hostname: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// An engine-API call relayed through the tunnel. The request/response
/// bodies are opaque to the tunnel; the agent replays them against its
/// local Docker socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRequest {
    pub request_id: Uuid,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// The engine's reply to a unary call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResponse {
    pub request_id: Uuid,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Response payload. JSON value for JSON replies; a base64 string
    /// when `is_binary` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub is_binary: bool,
}

/// One chunk of a streaming reply (log tail, event feed, pull progress).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub request_id: Uuid,
    pub data: String,
    /// Sub-stream tag for multiplexed engine streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StdStream>,
}

/// Which half of a multiplexed engine stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// Parameters for opening an interactive exec session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecStart {
    pub exec_id: String,
    pub container_id: String,
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub cols: u16,
    pub rows: u16,
}
