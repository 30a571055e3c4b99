//! Remote-agent tunnel.
//!
//! Agents on hosts the server cannot dial run a lightweight process that
//! dials *out* and keeps one persistent WebSocket open. Everything the
//! server needs from that host's Docker engine is multiplexed over that
//! single connection as JSON envelopes: unary API calls, open-ended
//! streams (log tails, event feeds, pull progress) and interactive
//! terminals.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       HTTP API callers                       │
//! │   send() / send_streaming() / open_exec() / list / close     │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────▼──────────────────────────────┐
//! │                        TunnelRegistry                        │
//! │   environment id -> AgentConnection (at most one, ever)      │
//! │   heartbeats, replacement semantics, status broadcast        │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │ one WebSocket per environment
//! ┌───────────────────────────────▼──────────────────────────────┐
//! │                     remote agent process                     │
//! │           replays calls against its local engine             │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod connection;
mod error;
mod exec;
mod handler;
mod registry;

pub use connection::{AgentConnection, ConnectionState, StreamEvent, StreamHandle};
pub use error::TunnelError;
pub use exec::{ExecBridge, ExecClientEvent, ExecHandle, ExecInput, ExecParams, ExecSession};
pub use handler::agent_ws_handler;
pub use registry::{ConnectionInfo, TunnelRegistry, TunnelStatusEvent};

use serde::{Deserialize, Serialize};

/// Tunnel tuning knobs, loaded from the `[tunnel]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Milliseconds between server-initiated pings. Keeps intermediating
    /// proxies from reaping the idle connection.
    pub ping_interval_ms: u64,
    /// Consecutive missed pings after which the connection is dropped.
    pub missed_ping_threshold: u32,
    /// Budget for a unary engine call.
    pub request_timeout_secs: u64,
    /// How long an agent gets to present its hello after connecting.
    pub handshake_timeout_secs: u64,
    /// Per-stream chunk buffer before the consumer counts as lagging.
    pub stream_buffer: usize,
    /// Outbound envelope queue per connection.
    pub outbound_buffer: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5_000,
            missed_ping_threshold: 3,
            request_timeout_secs: 30,
            handshake_timeout_secs: 10,
            stream_buffer: 64,
            outbound_buffer: 256,
        }
    }
}

impl TunnelConfig {
    /// Unary call budget as a [`std::time::Duration`].
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_interval_ms)
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Silence window after which a connection is considered dead:
    /// the ping interval times (missed threshold + 1).
    pub fn max_silence(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.ping_interval_ms * (self.missed_ping_threshold as u64 + 1),
        )
    }
}
