//! API request handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::environment::{CreateEnvironmentRequest, Environment};
use crate::token::{AgentToken, IssuedToken};
use crate::tunnel::ConnectionInfo;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// An environment record joined with its live connection state.
#[derive(Debug, Serialize)]
pub struct EnvironmentStatus {
    #[serde(flatten)]
    pub environment: Environment,
    pub connected: bool,
}

/// GET /api/environments
pub async fn list_environments(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<EnvironmentStatus>>> {
    let environments = state.environments.list().await?;
    let statuses = environments
        .into_iter()
        .map(|environment| {
            let connected = state.tunnels.is_connected(&environment.id);
            EnvironmentStatus {
                environment,
                connected,
            }
        })
        .collect();
    Ok(Json(statuses))
}

/// POST /api/environments
pub async fn create_environment(
    State(state): State<AppState>,
    Json(request): Json<CreateEnvironmentRequest>,
) -> ApiResult<(StatusCode, Json<Environment>)> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("Environment name cannot be empty"));
    }
    let environment = state.environments.create(request).await?;
    Ok((StatusCode::CREATED, Json(environment)))
}

/// GET /api/environments/{id}
pub async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EnvironmentStatus>> {
    let environment = state
        .environments
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Environment not found: {id}")))?;
    let connected = state.tunnels.is_connected(&environment.id);
    Ok(Json(EnvironmentStatus {
        environment,
        connected,
    }))
}

/// DELETE /api/environments/{id}
///
/// Force-disconnects any live agent before removing the record.
pub async fn delete_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.tunnels.close_connection(&id).await {
        info!("Force-disconnected agent for deleted environment {id}");
    }
    let deleted = state.environments.delete(&id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("Environment not found: {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/connections
pub async fn list_connections(State(state): State<AppState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.tunnels.list_connections())
}

/// Request body for token issuance.
#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    pub environment_id: String,
    pub label: String,
    #[serde(default)]
    pub expires_in_secs: Option<i64>,
}

/// POST /api/tokens
pub async fn create_token(
    State(state): State<AppState>,
    Json(request): Json<CreateTokenRequest>,
) -> ApiResult<(StatusCode, Json<IssuedToken>)> {
    state
        .environments
        .get(&request.environment_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("Environment not found: {}", request.environment_id))
        })?;

    let issued = state
        .tokens
        .issue(&request.environment_id, &request.label, request.expires_in_secs)
        .await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// Query filter for token listing.
#[derive(Debug, Default, Deserialize)]
pub struct TokenListQuery {
    pub environment_id: Option<String>,
}

/// GET /api/tokens
pub async fn list_tokens(
    State(state): State<AppState>,
    Query(query): Query<TokenListQuery>,
) -> ApiResult<Json<Vec<AgentToken>>> {
    let tokens = state.tokens.list(query.environment_id.as_deref()).await?;
    Ok(Json(tokens))
}

/// DELETE /api/tokens/{id}
pub async fn revoke_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let revoked = state.tokens.revoke(&id).await?;
    if !revoked {
        return Err(ApiError::not_found(format!("Token not found: {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/events
///
/// Server-sent events: connect/disconnect lifecycle plus relayed
/// container events and metrics pushes.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.tunnels.subscribe_status();
    let stream = BroadcastStream::new(receiver).filter_map(|item| {
        // Lagged subscribers skip missed events rather than erroring out.
        item.ok()
            .and_then(|event| Event::default().json_data(&event).ok())
            .map(Ok::<_, Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
