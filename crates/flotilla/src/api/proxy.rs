//! Docker-engine proxy: unary, streaming, and terminal bridging.
//!
//! Dashboard calls land here and are relayed to the environment's
//! engine over whichever backend applies. Engine-API payloads are
//! opaque; this layer only moves status, headers and bytes.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header};
use axum::response::Response;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use flotilla_protocol::EngineResponse;

use crate::engine::EngineCall;
use crate::environment::Environment;
use crate::tunnel::{ExecClientEvent, ExecInput, ExecParams, StreamEvent};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Upper bound on a proxied request body.
const MAX_PROXY_BODY: usize = 8 * 1024 * 1024;

/// Buffer for terminal client events.
const TERMINAL_BUFFER_SIZE: usize = 64;

/// Headers never forwarded to the engine.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "authorization",
    "cookie",
];

/// ANY /api/environments/{id}/docker/{*path}
///
/// Unary engine proxy. The reply is the engine's own status, headers
/// and body, whichever backend carried it.
pub async fn proxy_docker(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    request: Request<Body>,
) -> ApiResult<Response> {
    let environment = lookup_environment(&state, &id).await?;
    let call = build_call(&path, request).await?;

    debug!(
        "Proxying {} {} to environment {}",
        call.method, call.path, environment.id
    );

    let response = state.engine.request(&environment, call).await?;
    engine_response_to_http(response)
}

/// GET /api/environments/{id}/docker-stream/{*path}
///
/// Streaming engine proxy for open-ended replies: log tails, event
/// feeds, image pull/push progress. Chunks are forwarded as they
/// arrive; the body ends when the stream does. Dropping the response
/// cancels the upstream producer.
pub async fn proxy_docker_stream(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    request: Request<Body>,
) -> ApiResult<Response> {
    let environment = lookup_environment(&state, &id).await?;
    let call = build_call(&path, request).await?;

    let handle = state.engine.request_streamed(&environment, call).await?;
    let events = handle.into_events();

    // map_while: forward chunks until the terminal event ends the body.
    use tokio_stream::StreamExt as _;
    let body_stream = ReceiverStream::new(events).map_while(|event| match event {
        StreamEvent::Data { data, .. } => Some(Ok::<_, std::convert::Infallible>(Bytes::from(data))),
        StreamEvent::End { .. } => None,
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .map_err(|e| ApiError::internal(format!("building stream response: {e}")))?;
    Ok(response)
}

/// Terminal open parameters.
#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    pub container: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Messages a terminal client sends over its WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TerminalClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// GET /api/environments/{id}/terminal
///
/// WebSocket bridge between a dashboard terminal and an exec session
/// inside a container on the target environment.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let environment = lookup_environment(&state, &id).await?;
    info!(
        "Terminal requested for container {} on environment {}",
        query.container, environment.id
    );

    Ok(ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, environment, query)))
}

async fn handle_terminal_socket(
    socket: WebSocket,
    state: AppState,
    environment: Environment,
    query: TerminalQuery,
) {
    let (mut sender, mut receiver) = socket.split();

    let (client_tx, mut client_rx) = mpsc::channel(TERMINAL_BUFFER_SIZE);
    let params = ExecParams {
        container_id: query.container.clone(),
        cmd: vec![query.shell.clone()],
        user: query.user.clone(),
        cols: query.cols,
        rows: query.rows,
    };

    let handle = match state.engine.open_exec(&environment, params, client_tx).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(
                "Failed to open exec on environment {}: {e:?}",
                environment.id
            );
            let _ = sender
                .send(Message::Text(
                    terminal_event("end", &ApiError::from_anyhow(e).to_string()).into(),
                ))
                .await;
            let _ = sender.close().await;
            return;
        }
    };
    let exec_id = handle.exec_id().to_string();

    loop {
        tokio::select! {
            event = client_rx.recv() => match event {
                Some(ExecClientEvent::Ready) => {
                    if sender
                        .send(Message::Text(terminal_event("ready", "").into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(ExecClientEvent::Output(bytes)) => {
                    if sender.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Some(ExecClientEvent::End { reason }) => {
                    let _ = sender
                        .send(Message::Text(terminal_event("end", &reason).into()))
                        .await;
                    break;
                }
                None => break,
            },

            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<TerminalClientMessage>(&text) {
                        Ok(TerminalClientMessage::Input { data }) => {
                            if !handle.send(ExecInput::Data(data.into_bytes())).await {
                                break;
                            }
                        }
                        Ok(TerminalClientMessage::Resize { cols, rows }) => {
                            if !handle.send(ExecInput::Resize { cols, rows }).await {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("Ignoring malformed terminal message: {e}");
                        }
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if !handle.send(ExecInput::Data(bytes.to_vec())).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Terminal WebSocket error: {e}");
                    break;
                }
            },
        }
    }

    // Dropping the handle counts as the local client disconnecting; the
    // agent gets exec_end{user_closed} and the session is removed.
    drop(handle);
    let _ = sender.close().await;
    info!("Terminal session {exec_id} closed");
}

fn terminal_event(kind: &str, reason: &str) -> String {
    if reason.is_empty() {
        format!(r#"{{"type":"{kind}"}}"#)
    } else {
        serde_json::json!({"type": kind, "reason": reason}).to_string()
    }
}

async fn lookup_environment(state: &AppState, id: &str) -> ApiResult<Environment> {
    state
        .environments
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Environment not found: {id}")))
}

/// Turn an inbound HTTP request into a backend-agnostic engine call.
async fn build_call(path: &str, request: Request<Body>) -> ApiResult<EngineCall> {
    let method = request.method().as_str().to_string();
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let full_path = format!("/{path}{query}");

    let headers = forwarded_headers(request.headers());

    let body_bytes = axum::body::to_bytes(request.into_body(), MAX_PROXY_BODY)
        .await
        .map_err(|e| ApiError::bad_request(format!("reading request body: {e}")))?;
    let body = if body_bytes.is_empty() {
        None
    } else {
        Some(serde_json::from_slice::<Value>(&body_bytes).map_err(|e| {
            ApiError::bad_request(format!("engine request body must be JSON: {e}"))
        })?)
    };

    let mut call = EngineCall::new(method, full_path);
    if !headers.is_empty() {
        call = call.with_headers(headers);
    }
    if let Some(body) = body {
        call = call.with_body(body);
    }
    Ok(call)
}

fn forwarded_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !SKIPPED_REQUEST_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Convert an engine response into an HTTP reply for the dashboard.
fn engine_response_to_http(response: EngineResponse) -> ApiResult<Response> {
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);

    let body_bytes = match (&response.body, response.is_binary) {
        (None, _) => Bytes::new(),
        (Some(Value::String(data)), true) => Bytes::from(STANDARD.decode(data).map_err(|e| {
            ApiError::BadGateway(format!("agent sent invalid binary payload: {e}"))
        })?),
        (Some(Value::String(data)), false) => Bytes::from(data.clone()),
        (Some(value), _) => Bytes::from(
            serde_json::to_vec(value)
                .map_err(|e| ApiError::internal(format!("serializing engine body: {e}")))?,
        ),
    };

    let mut http_response = Response::builder().status(status);
    if let Some(headers) = http_response.headers_mut() {
        for (name, value) in &response.headers {
            let Ok(name) = name.parse::<HeaderName>() else {
                continue;
            };
            if matches!(name.as_str(), "content-length" | "transfer-encoding" | "connection") {
                continue;
            }
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }
    }

    http_response
        .body(Body::from(body_bytes))
        .map_err(|e| ApiError::internal(format!("building proxy response: {e}")))
}
