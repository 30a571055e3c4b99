//! Wire protocol for the Flotilla agent tunnel.
//!
//! A remote agent dials out to the server over a single persistent
//! WebSocket and both sides exchange JSON envelopes. Every envelope is a
//! discriminated message with a `type` tag; payload fields are camelCase
//! on the wire. Unary calls, open-ended streams and interactive exec
//! sessions are all multiplexed over the one connection, correlated by
//! request id (streams, unary) or exec id (terminals), two independent
//! namespaces.

mod envelope;

pub use envelope::{
    AgentHello, Envelope, EngineRequest, EngineResponse, ExecStart, StdStream, StreamChunk,
};
