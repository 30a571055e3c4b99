//! Environment module.
//!
//! An environment is one managed Docker engine: either a remote host
//! reached through an agent tunnel, or a local engine socket.

mod models;
mod repository;

pub use models::{AgentIdentity, CreateEnvironmentRequest, Environment, EnvironmentKind};
pub use repository::EnvironmentRepository;
