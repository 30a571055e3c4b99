//! Engine backends - unified access to Docker engines.
//!
//! This module defines the `EngineBackend` trait that abstracts away how
//! an environment's Docker engine is reached: through an agent tunnel
//! (the environment dialed in) or a local UNIX socket.
//!
//! Both backends implement the same interface, so API handlers use
//! identical code paths regardless of where the engine lives.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      flotilla server                        │
//! │                                                             │
//! │   "Resolve environment → call EngineBackend"                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         │                           │
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │   Tunnel Backend  │     │   Local Backend   │
//! │                   │     │                   │
//! │ Envelopes over a  │     │ HTTP/1.1 over the │
//! │ dialed-in agent   │     │ engine UNIX       │
//! │ WebSocket         │     │ socket            │
//! └───────────────────┘     └───────────────────┘
//! ```

mod local;
mod tunnel;

pub use local::{LocalEngine, StreamDemuxer};
pub use tunnel::TunnelEngine;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use flotilla_protocol::EngineResponse;

use crate::environment::{Environment, EnvironmentKind};
use crate::tunnel::{ExecClientEvent, ExecHandle, ExecParams, StreamHandle, TunnelRegistry};

/// One engine-API call, backend-agnostic.
#[derive(Debug, Clone)]
pub struct EngineCall {
    pub method: String,
    pub path: String,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<Value>,
}

impl EngineCall {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: None,
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Unified interface to a Docker engine, however it is reached.
///
/// Tunnel failures surface as [`crate::tunnel::TunnelError`] inside the
/// `anyhow` error and are downcast by the API error mapper.
#[async_trait]
pub trait EngineBackend: Send + Sync {
    /// One call, one response.
    async fn request(&self, env: &Environment, call: EngineCall) -> Result<EngineResponse>;

    /// A call whose response is chunked and open-ended (log tails,
    /// event feeds, pull/push progress).
    async fn request_streamed(&self, env: &Environment, call: EngineCall) -> Result<StreamHandle>;

    /// Open an interactive exec session inside a container. Returns
    /// after dispatch; readiness and output arrive on `client`.
    async fn open_exec(
        &self,
        env: &Environment,
        params: ExecParams,
        client: mpsc::Sender<ExecClientEvent>,
    ) -> Result<ExecHandle>;
}

/// Routes each call to the backend matching the environment kind.
pub struct EngineRouter {
    tunnel: TunnelEngine,
    local: LocalEngine,
}

impl EngineRouter {
    /// Create a new router. `default_socket` is used for local
    /// environments that do not set their own socket path.
    pub fn new(registry: Arc<TunnelRegistry>, default_socket: String) -> Self {
        Self {
            tunnel: TunnelEngine::new(registry),
            local: LocalEngine::new(default_socket),
        }
    }

    pub fn backend_for(&self, env: &Environment) -> &dyn EngineBackend {
        match env.kind {
            EnvironmentKind::Agent => &self.tunnel,
            EnvironmentKind::Local => &self.local,
        }
    }

    pub async fn request(&self, env: &Environment, call: EngineCall) -> Result<EngineResponse> {
        self.backend_for(env).request(env, call).await
    }

    pub async fn request_streamed(
        &self,
        env: &Environment,
        call: EngineCall,
    ) -> Result<StreamHandle> {
        self.backend_for(env).request_streamed(env, call).await
    }

    pub async fn open_exec(
        &self,
        env: &Environment,
        params: ExecParams,
        client: mpsc::Sender<ExecClientEvent>,
    ) -> Result<ExecHandle> {
        self.backend_for(env).open_exec(env, params, client).await
    }
}

impl std::fmt::Debug for EngineRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRouter").finish_non_exhaustive()
    }
}
