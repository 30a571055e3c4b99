//! Token authority module.
//!
//! Issues and validates the opaque bearer tokens agents present during
//! the tunnel handshake. Only salted hashes are ever persisted; the raw
//! token is returned exactly once, at issuance.

mod models;
mod repository;
mod service;

pub use models::{AgentToken, IssuedToken, TokenValidation};
pub use repository::TokenRepository;
pub use service::TokenService;
