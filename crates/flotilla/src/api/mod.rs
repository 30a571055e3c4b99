//! HTTP API surface.
//!
//! Thin and tunnel-centric: environment records, token issuance, the
//! agent dial-in endpoint, and the Docker-engine proxy (unary,
//! streaming, terminal) that relays dashboard calls through the tunnel
//! or the local socket.

mod error;
mod handlers;
mod proxy;
mod routes;
mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
