//! Application state shared across handlers.

use std::sync::Arc;

use crate::engine::EngineRouter;
use crate::environment::EnvironmentRepository;
use crate::token::TokenService;
use crate::tunnel::TunnelRegistry;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Environment persistence.
    pub environments: EnvironmentRepository,
    /// Token authority for agent handshakes.
    pub tokens: Arc<TokenService>,
    /// Live agent connections.
    pub tunnels: Arc<TunnelRegistry>,
    /// Unified engine access (tunnel or local socket).
    pub engine: Arc<EngineRouter>,
    /// Origins allowed by the CORS layer. `["*"]` means any.
    pub cors_origins: Vec<String>,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        environments: EnvironmentRepository,
        tokens: TokenService,
        tunnels: Arc<TunnelRegistry>,
        engine: EngineRouter,
        cors_origins: Vec<String>,
    ) -> Self {
        Self {
            environments,
            tokens: Arc::new(tokens),
            tunnels,
            engine: Arc::new(engine),
            cors_origins,
        }
    }
}
