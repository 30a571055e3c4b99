//! Tunnel error taxonomy.

use thiserror::Error;

/// Errors surfaced by the tunnel to calling collaborators.
///
/// Per-request failures never tear down a connection; `ConnectionReplaced`
/// and `ConnectionClosed` are delivered to every pending call when the
/// connection itself goes away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// Handshake token was missing, malformed, revoked or expired.
    /// Terminal for the connection attempt only.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Caller addressed an environment with no live connection.
    /// Raised synchronously, before any pending entry is created.
    #[error("No agent connected for environment {0}")]
    AgentNotConnected(String),

    /// No response arrived within the configured budget. The pending
    /// entry has been removed.
    #[error("Request timed out")]
    RequestTimeout,

    /// A new agent handshake superseded this connection while the call
    /// was in flight.
    #[error("Connection replaced by new agent")]
    ConnectionReplaced,

    /// The transport closed while the call was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer sent something the protocol does not allow.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}
