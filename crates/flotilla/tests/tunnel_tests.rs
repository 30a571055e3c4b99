//! Tunnel integration tests: a fake agent over a real WebSocket.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tower::ServiceExt;

use flotilla::api::{self, AppState};
use flotilla_protocol::{AgentHello, EngineResponse, Envelope, StreamChunk};

use common::{create_agent_environment, test_state};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (AppState, String) {
    let state = test_state().await;
    let router = api::create_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (state, addr.to_string())
}

fn hello(token: &str, agent_id: &str) -> Envelope {
    Envelope::Hello(AgentHello {
        token: token.to_string(),
        agent_id: agent_id.to_string(),
        agent_name: format!("{agent_id}-host"),
        version: "0.2.1".to_string(),
        docker_version: "27.3.1".to_string(),
        hostname: "edge-01".to_string(),
        capabilities: vec!["exec".to_string()],
    })
}

async fn send_envelope(socket: &mut AgentSocket, envelope: &Envelope) {
    let text = serde_json::to_string(envelope).unwrap();
    socket.send(WsMessage::Text(text.into())).await.unwrap();
}

/// Next non-ping envelope, or `None` once the server closes the socket.
async fn next_envelope(socket: &mut AgentSocket) -> Option<Envelope> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for envelope")?;
        match message {
            Ok(WsMessage::Text(text)) => {
                let envelope: Envelope = serde_json::from_str(text.as_str()).unwrap();
                if matches!(envelope, Envelope::Ping { .. }) {
                    continue;
                }
                return Some(envelope);
            }
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn connect_agent(addr: &str, token: &str, agent_id: &str) -> AgentSocket {
    let (mut socket, _) = connect_async(format!("ws://{addr}/api/agent/ws"))
        .await
        .unwrap();
    send_envelope(&mut socket, &hello(token, agent_id)).await;
    socket
}

/// A valid hello is answered with welcome, the registry reflects the
/// connection, and the agent identity lands in the environment record.
#[tokio::test]
async fn test_handshake_welcome() {
    let (state, addr) = spawn_server().await;
    let env = create_agent_environment(&state, "edge-01").await;
    let issued = state.tokens.issue(&env.id, "agent", None).await.unwrap();

    let mut agent = connect_agent(&addr, &issued.token, "agent-a").await;
    match next_envelope(&mut agent).await.unwrap() {
        Envelope::Welcome { environment_id } => assert_eq!(environment_id, env.id),
        other => panic!("expected welcome, got {other:?}"),
    }

    assert!(state.tunnels.is_connected(&env.id));

    let record = state.environments.get(&env.id).await.unwrap().unwrap();
    assert_eq!(record.agent_id.as_deref(), Some("agent-a"));
    assert!(record.last_seen_at.is_some());
}

/// A bad token is answered with an error envelope and a close; no
/// registry entry is created.
#[tokio::test]
async fn test_invalid_token_rejected() {
    let (state, addr) = spawn_server().await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/api/agent/ws"))
        .await
        .unwrap();
    send_envelope(&mut socket, &hello("fta_bogus.bogus", "agent-x")).await;

    match next_envelope(&mut socket).await.unwrap() {
        Envelope::Error { message } => {
            assert!(message.to_lowercase().contains("authentication failed"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(next_envelope(&mut socket).await, None);
    assert!(state.tunnels.list_connections().is_empty());
}

/// A unary call flows through the tunnel and back, both via the
/// registry directly and through the HTTP proxy endpoint.
#[tokio::test]
async fn test_unary_roundtrip_and_proxy() {
    let (state, addr) = spawn_server().await;
    let env = create_agent_environment(&state, "edge-01").await;
    let issued = state.tokens.issue(&env.id, "agent", None).await.unwrap();

    let mut agent = connect_agent(&addr, &issued.token, "agent-a").await;
    assert!(matches!(
        next_envelope(&mut agent).await.unwrap(),
        Envelope::Welcome { .. }
    ));

    // Fake agent: answer every request with a canned container list.
    let agent_task = tokio::spawn(async move {
        while let Some(envelope) = next_envelope(&mut agent).await {
            if let Envelope::Request(request) = envelope {
                let response = Envelope::Response(EngineResponse {
                    request_id: request.request_id,
                    status_code: 200,
                    headers: [("content-type".to_string(), "application/json".to_string())]
                        .into(),
                    body: Some(json!([{"Id": "c1"}])),
                    is_binary: false,
                });
                send_envelope(&mut agent, &response).await;
            }
        }
    });

    // Direct registry call.
    let response = state
        .tunnels
        .send(&env.id, "GET", "/containers/json", None, None)
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body.unwrap()[0]["Id"], "c1");

    // Whole HTTP proxy path.
    let app = api::create_router(state.clone());
    let http_response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/environments/{}/docker/containers/json", env.id))
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(http_response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(http_response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json[0]["Id"], "c1");

    agent_task.abort();
}

/// Scenario C over the wire: chunks arrive in order, then exactly one
/// terminal event.
#[tokio::test]
async fn test_streaming_over_tunnel() {
    let (state, addr) = spawn_server().await;
    let env = create_agent_environment(&state, "edge-01").await;
    let issued = state.tokens.issue(&env.id, "agent", None).await.unwrap();

    let mut agent = connect_agent(&addr, &issued.token, "agent-a").await;
    assert!(matches!(
        next_envelope(&mut agent).await.unwrap(),
        Envelope::Welcome { .. }
    ));

    // Fake agent: answer the log-follow request with three chunks and
    // a terminator.
    let agent_task = tokio::spawn(async move {
        while let Some(envelope) = next_envelope(&mut agent).await {
            if let Envelope::Request(request) = envelope {
                for i in 0..3 {
                    send_envelope(
                        &mut agent,
                        &Envelope::Stream(StreamChunk {
                            request_id: request.request_id,
                            data: format!("log line {i}\n"),
                            stream: None,
                        }),
                    )
                    .await;
                }
                send_envelope(
                    &mut agent,
                    &Envelope::StreamEnd {
                        request_id: request.request_id,
                        reason: "stream ended".to_string(),
                    },
                )
                .await;
            }
        }
    });

    let mut handle = state
        .tunnels
        .send_streaming(&env.id, "GET", "/containers/c1/logs?follow=1", None, None)
        .await
        .unwrap();

    use flotilla::tunnel::StreamEvent;
    for i in 0..3 {
        match handle.recv().await.unwrap() {
            StreamEvent::Data { data, .. } => assert_eq!(data, format!("log line {i}\n")),
            other => panic!("expected data, got {other:?}"),
        }
    }
    assert_eq!(
        handle.recv().await.unwrap(),
        StreamEvent::End {
            reason: "stream ended".to_string()
        }
    );
    assert_eq!(handle.recv().await, None);

    agent_task.abort();
}

/// Scenario B over the wire: a second handshake for the same
/// environment supersedes the first connection; the first socket is
/// closed by the server.
#[tokio::test]
async fn test_reconnect_replaces_connection() {
    let (state, addr) = spawn_server().await;
    let env = create_agent_environment(&state, "edge-01").await;
    let issued = state.tokens.issue(&env.id, "agent", None).await.unwrap();

    let mut agent_a = connect_agent(&addr, &issued.token, "agent-a").await;
    assert!(matches!(
        next_envelope(&mut agent_a).await.unwrap(),
        Envelope::Welcome { .. }
    ));

    let mut agent_b = connect_agent(&addr, &issued.token, "agent-b").await;
    assert!(matches!(
        next_envelope(&mut agent_b).await.unwrap(),
        Envelope::Welcome { .. }
    ));

    // The server closes the superseded socket.
    loop {
        match next_envelope(&mut agent_a).await {
            None => break,
            Some(_) => continue,
        }
    }

    let connections = state.tunnels.list_connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].agent.agent_id, "agent-b");
    assert!(state.tunnels.is_connected(&env.id));
}
