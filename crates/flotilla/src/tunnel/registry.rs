//! Connection registry and lifecycle management.
//!
//! The registry is the only process-wide mutable tunnel state. It holds
//! at most one live [`AgentConnection`] per environment; a new handshake
//! for an environment deterministically supersedes the old connection,
//! failing all of its pending work before the replacement goes live.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use flotilla_protocol::{EngineRequest, EngineResponse, Envelope, ExecStart};

use super::connection::{AgentConnection, ConnectionState, StreamHandle};
use super::exec::{ExecBridge, ExecClientEvent, ExecHandle, ExecInput, ExecParams, ExecSession};
use super::{TunnelConfig, TunnelError};
use crate::environment::{AgentIdentity, EnvironmentRepository};

/// Size of the status broadcast channel.
const STATUS_BUFFER_SIZE: usize = 256;

/// Exec input queue per session.
const EXEC_INPUT_BUFFER_SIZE: usize = 32;

/// A live connection, as reported to external collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub environment_id: String,
    #[serde(flatten)]
    pub agent: AgentIdentity,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Push notifications for external collaborators (notifications, audit,
/// dashboard live views).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelStatusEvent {
    AgentConnected {
        environment_id: String,
        agent_name: String,
        version: String,
    },
    AgentDisconnected {
        environment_id: String,
        reason: String,
    },
    ContainerEvent {
        environment_id: String,
        action: String,
        container_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        attributes: Option<Value>,
    },
    Metrics {
        environment_id: String,
        data: Value,
    },
}

/// Registry of live agent connections, one per environment.
pub struct TunnelRegistry {
    connections: DashMap<String, Arc<AgentConnection>>,
    exec: ExecBridge,
    environments: EnvironmentRepository,
    status_tx: broadcast::Sender<TunnelStatusEvent>,
    config: TunnelConfig,
}

impl TunnelRegistry {
    /// Create a new registry.
    pub fn new(environments: EnvironmentRepository, config: TunnelConfig) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_BUFFER_SIZE);
        Self {
            connections: DashMap::new(),
            exec: ExecBridge::new(),
            environments,
            status_tx,
            config,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Subscribe to connect/disconnect and push notifications.
    pub fn subscribe_status(&self) -> broadcast::Receiver<TunnelStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Install a freshly authenticated connection, superseding any live
    /// connection for the same environment.
    pub async fn register(&self, conn: Arc<AgentConnection>) {
        let environment_id = conn.environment_id.clone();

        // Atomic swap: the table never holds two entries for one
        // environment, even across rapid reconnects.
        let previous = self.connections.insert(environment_id.clone(), conn.clone());
        if let Some(old) = previous {
            info!(
                "Agent {} replaces live connection for environment {}",
                conn.identity.agent_id, environment_id
            );
            self.teardown(
                &old,
                ConnectionState::Replaced,
                TunnelError::ConnectionReplaced,
                "Connection replaced by new agent",
            );
            let _ = self.status_tx.send(TunnelStatusEvent::AgentDisconnected {
                environment_id: environment_id.clone(),
                reason: "replaced".to_string(),
            });
        }

        conn.set_state(ConnectionState::Active);
        self.start_heartbeat(&conn);

        if let Err(e) = self
            .environments
            .update_agent_identity(&environment_id, &conn.identity)
            .await
        {
            warn!("Failed to persist agent identity for {environment_id}: {e:?}");
        }

        info!(
            "Agent {} ({} v{}) connected for environment {}",
            conn.identity.agent_id, conn.identity.agent_name, conn.identity.version, environment_id
        );
        let _ = self.status_tx.send(TunnelStatusEvent::AgentConnected {
            environment_id,
            agent_name: conn.identity.agent_name.clone(),
            version: conn.identity.version.clone(),
        });
    }

    /// Remove a connection on transport close. Idempotent per instance:
    /// if the table entry already points at a replacement, nothing
    /// happens.
    pub async fn unregister(&self, conn: &Arc<AgentConnection>) {
        let environment_id = conn.environment_id.clone();
        let removed = self
            .connections
            .remove_if(&environment_id, |_, current| Arc::ptr_eq(current, conn))
            .is_some();
        if !removed {
            return;
        }

        self.teardown(
            conn,
            ConnectionState::Closed,
            TunnelError::ConnectionClosed,
            "Connection closed",
        );

        if let Err(e) = self.environments.touch_last_seen(&environment_id).await {
            warn!("Failed to persist last-seen for {environment_id}: {e:?}");
        }

        info!("Agent disconnected from environment {environment_id}");
        let _ = self.status_tx.send(TunnelStatusEvent::AgentDisconnected {
            environment_id,
            reason: "closed".to_string(),
        });
    }

    /// Deterministic cleanup for a superseded or closed connection:
    /// stop the heartbeat, fail every pending call with one terminal
    /// outcome, tear down its exec sessions, close the transport.
    fn teardown(
        &self,
        conn: &Arc<AgentConnection>,
        state: ConnectionState,
        error: TunnelError,
        reason: &str,
    ) {
        conn.abort_heartbeat();
        conn.set_state(state);
        conn.fail_pending(error, reason);
        self.exec.close_for_environment(&conn.environment_id, reason);
        conn.close_outbound();
    }

    fn start_heartbeat(&self, conn: &Arc<AgentConnection>) {
        let interval = self.config.ping_interval();
        let max_silence = self.config.max_silence();
        let task_conn = conn.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let silence = (Utc::now() - task_conn.last_heartbeat())
                    .to_std()
                    .unwrap_or_default();
                if silence > max_silence {
                    warn!(
                        "Environment {} missed heartbeats for {silence:?}, dropping connection",
                        task_conn.environment_id
                    );
                    // Closing the outbound queue shuts the socket task
                    // down, which drives the normal unregister path.
                    task_conn.close_outbound();
                    break;
                }

                let ping = Envelope::Ping {
                    timestamp: Utc::now().timestamp_millis(),
                };
                if task_conn.send_envelope(ping).await.is_err() {
                    break;
                }
            }
        });
        conn.set_heartbeat_task(task);
    }

    /// Whether an environment has a live connection.
    pub fn is_connected(&self, environment_id: &str) -> bool {
        self.connections.contains_key(environment_id)
    }

    /// Snapshot of all live connections.
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| {
                let conn = entry.value();
                ConnectionInfo {
                    environment_id: conn.environment_id.clone(),
                    agent: conn.identity.clone(),
                    connected_at: conn.connected_at,
                    last_heartbeat: conn.last_heartbeat(),
                }
            })
            .collect()
    }

    /// The live connection for an environment, or `AgentNotConnected`.
    /// Synchronous on purpose: callers addressing a disconnected
    /// environment fail before any pending entry exists.
    fn connection(&self, environment_id: &str) -> Result<Arc<AgentConnection>, TunnelError> {
        self.connections
            .get(environment_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TunnelError::AgentNotConnected(environment_id.to_string()))
    }

    /// Relay a unary engine-API call and wait for the correlated
    /// response.
    pub async fn send(
        &self,
        environment_id: &str,
        method: &str,
        path: &str,
        headers: Option<HashMap<String, String>>,
        body: Option<Value>,
    ) -> Result<EngineResponse, TunnelError> {
        let conn = self.connection(environment_id)?;
        let request = EngineRequest {
            request_id: Uuid::new_v4(),
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
        };
        conn.request(request, self.config.request_timeout()).await
    }

    /// Relay a streaming engine-API call (log tail, event feed, pull
    /// progress). Chunks arrive on the returned handle until the
    /// single terminal event.
    pub async fn send_streaming(
        &self,
        environment_id: &str,
        method: &str,
        path: &str,
        headers: Option<HashMap<String, String>>,
        body: Option<Value>,
    ) -> Result<StreamHandle, TunnelError> {
        let conn = self.connection(environment_id)?;
        let request = EngineRequest {
            request_id: Uuid::new_v4(),
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
        };
        conn.open_stream(request, self.config.stream_buffer).await
    }

    /// Open an interactive exec session. Returns after `exec_start` is
    /// dispatched; readiness and output arrive asynchronously on the
    /// client channel.
    pub async fn open_exec(
        self: &Arc<Self>,
        environment_id: &str,
        params: ExecParams,
        client: mpsc::Sender<ExecClientEvent>,
    ) -> Result<ExecHandle, TunnelError> {
        let conn = self.connection(environment_id)?;
        let exec_id = Uuid::new_v4().to_string();

        self.exec.insert(ExecSession {
            exec_id: exec_id.clone(),
            environment_id: environment_id.to_string(),
            client,
        });

        let start = Envelope::ExecStart(ExecStart {
            exec_id: exec_id.clone(),
            container_id: params.container_id,
            cmd: params.cmd,
            user: params.user,
            cols: params.cols,
            rows: params.rows,
        });
        if let Err(e) = conn.send_envelope(start).await {
            self.exec.remove(&exec_id);
            return Err(e);
        }

        // Pump local client input into exec_input/exec_resize envelopes.
        // The channel closing means the local client disconnected.
        let (input_tx, mut input_rx) = mpsc::channel(EXEC_INPUT_BUFFER_SIZE);
        let registry = Arc::clone(self);
        let pump_conn = conn.clone();
        let pump_id = exec_id.clone();
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let envelope = match input {
                    ExecInput::Data(bytes) => Envelope::ExecInput {
                        exec_id: pump_id.clone(),
                        data: STANDARD.encode(&bytes),
                    },
                    ExecInput::Resize { cols, rows } => Envelope::ExecResize {
                        exec_id: pump_id.clone(),
                        cols,
                        rows,
                    },
                };
                if pump_conn.send_envelope(envelope).await.is_err() {
                    break;
                }
            }
            if registry.exec.remove(&pump_id).is_some() {
                let _ = pump_conn.try_send_envelope(Envelope::ExecEnd {
                    exec_id: pump_id.clone(),
                    reason: "user_closed".to_string(),
                });
            }
        });

        Ok(ExecHandle::new(exec_id, input_tx))
    }

    /// Dispatch target: the remote PTY is up.
    pub fn exec_ready(&self, exec_id: &str) {
        self.exec.forward_ready(exec_id);
    }

    /// Dispatch target: decode base64 terminal output and forward it.
    pub fn exec_output(&self, exec_id: &str, data: &str) {
        match STANDARD.decode(data) {
            Ok(bytes) => self.exec.forward_output(exec_id, bytes),
            Err(e) => warn!("Dropping exec_output with invalid base64 for {exec_id}: {e}"),
        }
    }

    /// Dispatch target: the agent closed an exec session.
    pub fn exec_end(&self, exec_id: &str, reason: String) {
        self.exec.end_session(exec_id, reason);
    }

    /// Number of live exec sessions. Used by tests and diagnostics.
    pub fn exec_session_count(&self) -> usize {
        self.exec.len()
    }

    /// Forward an out-of-band container event to status subscribers.
    pub fn publish_container_event(
        &self,
        environment_id: &str,
        action: String,
        container_id: String,
        attributes: Option<Value>,
    ) {
        let _ = self.status_tx.send(TunnelStatusEvent::ContainerEvent {
            environment_id: environment_id.to_string(),
            action,
            container_id,
            attributes,
        });
    }

    /// Forward an out-of-band metrics snapshot to status subscribers.
    pub fn publish_metrics(&self, environment_id: &str, data: Value) {
        let _ = self.status_tx.send(TunnelStatusEvent::Metrics {
            environment_id: environment_id.to_string(),
            data,
        });
    }

    /// Administrative force-disconnect, e.g. on environment deletion.
    pub async fn close_connection(&self, environment_id: &str) -> bool {
        let Some(conn) = self
            .connections
            .get(environment_id)
            .map(|entry| entry.value().clone())
        else {
            return false;
        };
        self.unregister(&conn).await;
        true
    }

    /// Close every live connection (server shutdown).
    pub async fn shutdown(&self) {
        let conns: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in conns {
            self.unregister(&conn).await;
        }
    }
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("connections", &self.connections.len())
            .field("exec_sessions", &self.exec.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::super::connection::StreamEvent;
    use super::*;
    use crate::db::Database;
    use crate::environment::{CreateEnvironmentRequest, EnvironmentKind};
    use flotilla_protocol::StreamChunk;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    async fn test_registry(config: TunnelConfig) -> (Arc<TunnelRegistry>, String) {
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
        (Arc::new(TunnelRegistry::new(envs, config)), env.id)
    }

    fn identity(agent_id: &str) -> AgentIdentity {
        AgentIdentity {
            agent_id: agent_id.to_string(),
            agent_name: format!("{agent_id}-host"),
            version: "0.2.1".to_string(),
            docker_version: "27.3.1".to_string(),
            hostname: "edge-01".to_string(),
            capabilities: vec!["exec".to_string()],
        }
    }

    fn make_conn(env_id: &str, agent_id: &str) -> (Arc<AgentConnection>, Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(AgentConnection::new(
                env_id.to_string(),
                identity(agent_id),
                tx,
            )),
            rx,
        )
    }

    /// Scenario A: a send with no connection fails synchronously and
    /// never creates a pending entry anywhere.
    #[tokio::test]
    async fn test_send_without_connection_fails_immediately() {
        let (registry, _env) = test_registry(TunnelConfig::default()).await;

        let started = std::time::Instant::now();
        let result = registry.send("42", "GET", "/containers/json", None, None).await;
        assert_eq!(
            result.unwrap_err(),
            TunnelError::AgentNotConnected("42".to_string())
        );
        // Immediate, not a timeout.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!registry.is_connected("42"));
    }

    /// Scenario B: a reconnect supersedes the live connection; both
    /// in-flight requests on the old connection fail with
    /// `ConnectionReplaced` and the registry reflects the new agent.
    #[tokio::test]
    async fn test_replacement_fails_inflight_requests() {
        let (registry, env_id) = test_registry(TunnelConfig::default()).await;

        let (conn_a, _wire_a) = make_conn(&env_id, "agent-a");
        registry.register(conn_a.clone()).await;
        assert_eq!(conn_a.state(), ConnectionState::Active);

        let calls: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                let env_id = env_id.clone();
                tokio::spawn(async move {
                    registry.send(&env_id, "GET", "/containers/json", None, None).await
                })
            })
            .collect();
        // Let both calls reach the pending map.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn_a.pending_unary_len(), 2);

        let (conn_b, _wire_b) = make_conn(&env_id, "agent-b");
        registry.register(conn_b.clone()).await;

        for call in calls {
            assert_eq!(
                call.await.unwrap().unwrap_err(),
                TunnelError::ConnectionReplaced
            );
        }
        assert_eq!(conn_a.state(), ConnectionState::Replaced);
        assert_eq!(conn_a.pending_unary_len(), 0);
        assert!(registry.is_connected(&env_id));
        let infos = registry.list_connections();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].agent.agent_id, "agent-b");
    }

    /// Scenario C lives in `connection::tests`; here we check the
    /// registry-level stream path end to end.
    #[tokio::test]
    async fn test_streaming_through_registry() {
        let (registry, env_id) = test_registry(TunnelConfig::default()).await;
        let (conn, mut wire) = make_conn(&env_id, "agent-a");
        registry.register(conn.clone()).await;

        let mut handle = registry
            .send_streaming(&env_id, "GET", "/containers/c1/logs?follow=1", None, None)
            .await
            .unwrap();

        // Skip heartbeat pings; find the request envelope.
        let request_id = loop {
            match wire.recv().await.unwrap() {
                Envelope::Request(req) => break req.request_id,
                _ => continue,
            }
        };
        assert_eq!(request_id, handle.request_id());

        for i in 0..3 {
            conn.deliver_stream_chunk(StreamChunk {
                request_id,
                data: format!("chunk {i}"),
                stream: None,
            });
        }
        conn.end_stream(request_id, "stream ended".to_string());

        for i in 0..3 {
            assert_eq!(
                handle.recv().await.unwrap(),
                StreamEvent::Data {
                    data: format!("chunk {i}"),
                    substream: None
                }
            );
        }
        assert_eq!(
            handle.recv().await.unwrap(),
            StreamEvent::End {
                reason: "stream ended".to_string()
            }
        );
        assert_eq!(conn.pending_stream_len(), 0);
    }

    /// Scenario D: local client disconnect sends exec_end{user_closed}
    /// to the agent and removes the session; stray output afterwards is
    /// harmless.
    #[tokio::test]
    async fn test_exec_client_disconnect() {
        let (registry, env_id) = test_registry(TunnelConfig::default()).await;
        let (_conn, mut wire) = make_conn(&env_id, "agent-a");
        registry.register(_conn.clone()).await;

        let (client_tx, _client_rx) = mpsc::channel(8);
        let handle = registry
            .open_exec(
                &env_id,
                ExecParams {
                    container_id: "c1".to_string(),
                    cmd: vec!["/bin/sh".to_string()],
                    user: None,
                    cols: 80,
                    rows: 24,
                },
                client_tx,
            )
            .await
            .unwrap();
        let exec_id = handle.exec_id().to_string();
        assert_eq!(registry.exec_session_count(), 1);

        // Local client goes away.
        drop(handle);

        // The agent hears about it.
        let end = loop {
            match tokio::time::timeout(Duration::from_secs(1), wire.recv())
                .await
                .unwrap()
                .unwrap()
            {
                Envelope::ExecEnd { exec_id, reason } => break (exec_id, reason),
                _ => continue,
            }
        };
        assert_eq!(end, (exec_id.clone(), "user_closed".to_string()));
        assert_eq!(registry.exec_session_count(), 0);

        // Stray output for the closed session: dropped without error.
        registry.exec_output(&exec_id, &STANDARD.encode(b"late"));
        assert_eq!(registry.exec_session_count(), 0);
    }

    /// Scenario E: pings flow at the configured interval and every pong
    /// strictly advances the heartbeat timestamp.
    #[tokio::test]
    async fn test_heartbeat_pings_and_pong_bookkeeping() {
        let config = TunnelConfig {
            ping_interval_ms: 20,
            missed_ping_threshold: 1000,
            ..TunnelConfig::default()
        };
        let (registry, env_id) = test_registry(config).await;
        let (conn, mut wire) = make_conn(&env_id, "agent-a");
        registry.register(conn.clone()).await;

        let mut last = conn.last_heartbeat();
        let mut pings = 0;
        while pings < 5 {
            match tokio::time::timeout(Duration::from_secs(2), wire.recv())
                .await
                .unwrap()
                .unwrap()
            {
                Envelope::Ping { timestamp } => {
                    pings += 1;
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    // Answer through the real dispatch path.
                    super::super::handler::dispatch(&registry, &conn, Envelope::Pong { timestamp })
                        .await;
                    let now = conn.last_heartbeat();
                    assert!(now > last, "heartbeat must strictly advance");
                    last = now;
                }
                other => panic!("expected ping, got {other:?}"),
            }
        }
    }

    /// Open Question policy: a silent agent is evicted after the missed
    /// ping threshold, through the normal close path.
    #[tokio::test]
    async fn test_heartbeat_eviction_after_missed_pings() {
        let config = TunnelConfig {
            ping_interval_ms: 10,
            missed_ping_threshold: 3,
            ..TunnelConfig::default()
        };
        let (registry, env_id) = test_registry(config).await;
        let (conn, mut wire) = make_conn(&env_id, "agent-a");
        registry.register(conn.clone()).await;

        // Nobody answers the pings. The outbound queue closes once the
        // silence exceeds interval * (threshold + 1).
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match tokio::time::timeout_at(deadline, wire.recv()).await {
                Ok(Some(_envelope)) => continue,
                Ok(None) => break, // outbound closed: evicted
                Err(_) => panic!("connection was not evicted for silence"),
            }
        }

        // The socket task would call unregister on close; emulate it.
        registry.unregister(&conn).await;
        assert!(!registry.is_connected(&env_id));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    /// Registry invariant: one connection per environment, ever; close
    /// leaves no pending work behind.
    #[tokio::test]
    async fn test_close_connection_terminates_pending_work() {
        let (registry, env_id) = test_registry(TunnelConfig::default()).await;
        let (conn, _wire) = make_conn(&env_id, "agent-a");
        registry.register(conn.clone()).await;

        let call = {
            let registry = registry.clone();
            let env_id = env_id.clone();
            tokio::spawn(async move {
                registry.send(&env_id, "GET", "/info", None, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut stream = registry
            .send_streaming(&env_id, "GET", "/events", None, None)
            .await
            .unwrap();

        assert!(registry.close_connection(&env_id).await);
        assert!(!registry.is_connected(&env_id));

        assert_eq!(
            call.await.unwrap().unwrap_err(),
            TunnelError::ConnectionClosed
        );
        assert_eq!(
            stream.recv().await.unwrap(),
            StreamEvent::End {
                reason: "Connection closed".to_string()
            }
        );
        assert_eq!(conn.pending_unary_len(), 0);
        assert_eq!(conn.pending_stream_len(), 0);

        // Closing again is a no-op.
        assert!(!registry.close_connection(&env_id).await);
    }

    /// Status subscribers observe the connect/replace/disconnect
    /// lifecycle.
    #[tokio::test]
    async fn test_status_events() {
        let (registry, env_id) = test_registry(TunnelConfig::default()).await;
        let mut status = registry.subscribe_status();

        let (conn_a, _wire_a) = make_conn(&env_id, "agent-a");
        registry.register(conn_a.clone()).await;
        let (conn_b, _wire_b) = make_conn(&env_id, "agent-b");
        registry.register(conn_b.clone()).await;
        registry.close_connection(&env_id).await;

        assert!(matches!(
            status.recv().await.unwrap(),
            TunnelStatusEvent::AgentConnected { .. }
        ));
        assert!(matches!(
            status.recv().await.unwrap(),
            TunnelStatusEvent::AgentDisconnected { ref reason, .. } if reason == "replaced"
        ));
        assert!(matches!(
            status.recv().await.unwrap(),
            TunnelStatusEvent::AgentConnected { .. }
        ));
        assert!(matches!(
            status.recv().await.unwrap(),
            TunnelStatusEvent::AgentDisconnected { ref reason, .. } if reason == "closed"
        ));
    }
}
