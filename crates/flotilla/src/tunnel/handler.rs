//! Agent WebSocket handler.
//!
//! Agents dial in on `GET /api/agent/ws`. The socket task owns both
//! halves of the connection: it drains the outbound envelope queue onto
//! the wire and dispatches every inbound envelope by its type tag.
//! Malformed or unknown messages are logged and dropped; they never
//! desynchronize the connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use flotilla_protocol::{AgentHello, Envelope};

use super::TunnelError;
use super::connection::{AgentConnection, ConnectionState};
use super::registry::TunnelRegistry;
use crate::api::AppState;
use crate::environment::AgentIdentity;
use crate::token::TokenValidation;

/// WebSocket upgrade handler for agent dial-in.
///
/// GET /api/agent/ws
pub async fn agent_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let config = state.tunnels.config().clone();

    // Handshake: the very first frame must be a hello envelope.
    let hello = match await_hello(&mut receiver, config.handshake_timeout()).await {
        Ok(hello) => hello,
        Err(err) => {
            warn!("Agent handshake failed: {err}");
            send_direct(
                &mut sender,
                &Envelope::Error {
                    message: err.to_string(),
                },
            )
            .await;
            let _ = sender.close().await;
            return;
        }
    };

    let environment_id = match state.tokens.validate(&hello.token).await {
        Ok(TokenValidation::Valid { environment_id, .. }) => environment_id,
        Ok(TokenValidation::Invalid) => {
            warn!("Agent {} presented an invalid token", hello.agent_id);
            send_direct(
                &mut sender,
                &Envelope::Error {
                    message: TunnelError::AuthenticationFailed.to_string(),
                },
            )
            .await;
            let _ = sender.close().await;
            return;
        }
        Err(e) => {
            warn!("Token validation errored for agent {}: {e:?}", hello.agent_id);
            send_direct(
                &mut sender,
                &Envelope::Error {
                    message: "internal error".to_string(),
                },
            )
            .await;
            let _ = sender.close().await;
            return;
        }
    };

    let identity = AgentIdentity::from(&hello);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(config.outbound_buffer);
    let conn = Arc::new(AgentConnection::new(
        environment_id.clone(),
        identity,
        outbound_tx,
    ));
    conn.set_state(ConnectionState::Authenticated);

    // Registration supersedes any live connection for this environment.
    state.tunnels.register(conn.clone()).await;

    if conn
        .send_envelope(Envelope::Welcome {
            environment_id: environment_id.clone(),
        })
        .await
        .is_err()
    {
        state.tunnels.unregister(&conn).await;
        return;
    }

    loop {
        tokio::select! {
            queued = outbound_rx.recv() => match queued {
                Some(envelope) => {
                    let json = match serde_json::to_string(&envelope) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize envelope for environment {environment_id}: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                // Queue closed: the registry or heartbeat monitor
                // force-closed this connection.
                None => break,
            },

            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => dispatch(&state.tunnels, &conn, envelope).await,
                    Err(e) => warn!(
                        "Dropping malformed envelope from environment {environment_id}: {e}"
                    ),
                },
                Some(Ok(Message::Binary(_))) => {
                    debug!("Ignoring binary frame from environment {environment_id}");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Transport-level liveness counts too.
                    conn.touch_heartbeat();
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Agent closed connection for environment {environment_id}");
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error for environment {environment_id}: {e}");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = sender.close().await;
    state.tunnels.unregister(&conn).await;
    info!("Tunnel for environment {environment_id} shut down");
}

/// Route one inbound envelope. Correlation is purely by id; arrival
/// order across different ids carries no meaning.
pub(crate) async fn dispatch(
    registry: &Arc<TunnelRegistry>,
    conn: &Arc<AgentConnection>,
    envelope: Envelope,
) {
    match envelope {
        Envelope::Ping { timestamp } => {
            conn.touch_heartbeat();
            if conn.send_envelope(Envelope::Pong { timestamp }).await.is_err() {
                debug!("Could not answer ping on environment {}", conn.environment_id);
            }
        }
        Envelope::Pong { .. } => conn.touch_heartbeat(),

        Envelope::Response(response) => conn.resolve_response(response),
        Envelope::Stream(chunk) => conn.deliver_stream_chunk(chunk),
        Envelope::StreamEnd { request_id, reason } => conn.end_stream(request_id, reason),

        Envelope::ExecReady { exec_id } => registry.exec_ready(&exec_id),
        Envelope::ExecOutput { exec_id, data } => registry.exec_output(&exec_id, &data),
        Envelope::ExecEnd { exec_id, reason } => registry.exec_end(&exec_id, reason),

        Envelope::ContainerEvent {
            action,
            container_id,
            attributes,
        } => registry.publish_container_event(&conn.environment_id, action, container_id, attributes),
        Envelope::Metrics { data } => registry.publish_metrics(&conn.environment_id, data),

        Envelope::Hello(_) => {
            warn!(
                "Dropping duplicate hello from environment {}",
                conn.environment_id
            );
        }
        Envelope::Welcome { .. }
        | Envelope::Error { .. }
        | Envelope::Request(_)
        | Envelope::StreamCancel { .. }
        | Envelope::ExecStart(_)
        | Envelope::ExecInput { .. }
        | Envelope::ExecResize { .. } => {
            warn!(
                "Dropping server-bound envelope sent by agent on environment {}",
                conn.environment_id
            );
        }
        Envelope::Unknown => {
            warn!(
                "Dropping envelope with unknown type from environment {}",
                conn.environment_id
            );
        }
    }
}

/// Wait for the hello envelope, within the handshake budget.
async fn await_hello(
    receiver: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> Result<AgentHello, TunnelError> {
    let violation = |msg: &str| TunnelError::ProtocolViolation(msg.to_string());

    let result = tokio::time::timeout(timeout, async {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    return match serde_json::from_str::<Envelope>(&text) {
                        Ok(Envelope::Hello(hello)) => Ok(hello),
                        Ok(_) => Err(violation("expected hello envelope")),
                        Err(e) => Err(violation(&format!("malformed handshake: {e}"))),
                    };
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Binary(_)) => return Err(violation("expected text handshake")),
                Ok(Message::Close(_)) | Err(_) => return Err(TunnelError::ConnectionClosed),
            }
        }
        Err(TunnelError::ConnectionClosed)
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(violation("handshake timed out")),
    }
}

/// Write an envelope straight to the sink, for pre-registration errors.
async fn send_direct(sender: &mut SplitSink<WebSocket, Message>, envelope: &Envelope) {
    if let Ok(json) = serde_json::to_string(envelope) {
        let _ = sender.send(Message::Text(json.into())).await;
    }
}
