//! Test utilities and common setup.

use std::sync::Arc;

use axum::Router;

use flotilla::api::{self, AppState};
use flotilla::db::Database;
use flotilla::engine::EngineRouter;
use flotilla::environment::{
    CreateEnvironmentRequest, Environment, EnvironmentKind, EnvironmentRepository,
};
use flotilla::token::{TokenRepository, TokenService};
use flotilla::tunnel::{TunnelConfig, TunnelRegistry};

/// Tunnel timings tightened for tests. The eviction threshold stays
/// high because the fake agents here never answer pings.
fn test_tunnel_config() -> TunnelConfig {
    TunnelConfig {
        ping_interval_ms: 100,
        missed_ping_threshold: 1000,
        request_timeout_secs: 5,
        handshake_timeout_secs: 2,
        ..TunnelConfig::default()
    }
}

/// Create application state with all services initialized on an
/// in-memory database.
pub async fn test_state() -> AppState {
    let db = Database::in_memory().await.unwrap();

    let environments = EnvironmentRepository::new(db.pool().clone());
    let tokens = TokenService::new(TokenRepository::new(db.pool().clone()));

    let registry = Arc::new(TunnelRegistry::new(environments.clone(), test_tunnel_config()));
    let engine = EngineRouter::new(registry.clone(), "/var/run/docker.sock".to_string());

    AppState::new(
        environments,
        tokens,
        registry,
        engine,
        vec!["*".to_string()],
    )
}

/// Create a test application with all services initialized.
pub async fn test_app() -> Router {
    api::create_router(test_state().await)
}

/// Register an agent-mode environment.
pub async fn create_agent_environment(state: &AppState, name: &str) -> Environment {
    state
        .environments
        .create(CreateEnvironmentRequest {
            name: name.to_string(),
            kind: EnvironmentKind::Agent,
            docker_socket: None,
        })
        .await
        .unwrap()
}
