//! Tunnel-mode engine backend: delegates to the connection registry.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use flotilla_protocol::EngineResponse;

use super::{EngineBackend, EngineCall};
use crate::environment::Environment;
use crate::tunnel::{ExecClientEvent, ExecHandle, ExecParams, StreamHandle, TunnelRegistry};

/// Engine access for environments behind an agent tunnel.
pub struct TunnelEngine {
    registry: Arc<TunnelRegistry>,
}

impl TunnelEngine {
    pub fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EngineBackend for TunnelEngine {
    async fn request(&self, env: &Environment, call: EngineCall) -> Result<EngineResponse> {
        let response = self
            .registry
            .send(&env.id, &call.method, &call.path, call.headers, call.body)
            .await?;
        Ok(response)
    }

    async fn request_streamed(&self, env: &Environment, call: EngineCall) -> Result<StreamHandle> {
        let handle = self
            .registry
            .send_streaming(&env.id, &call.method, &call.path, call.headers, call.body)
            .await?;
        Ok(handle)
    }

    async fn open_exec(
        &self,
        env: &Environment,
        params: ExecParams,
        client: mpsc::Sender<ExecClientEvent>,
    ) -> Result<ExecHandle> {
        let handle = self.registry.open_exec(&env.id, params, client).await?;
        Ok(handle)
    }
}
