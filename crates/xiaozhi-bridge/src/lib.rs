//! Xiaozhi MCP bridge.
//!
//! Keeps a persistent WebSocket to a Xiaozhi AI-assistant endpoint and a
//! session to a local MCP gateway (SSE event stream in, HTTP posts out), and
//! relays opaque JSON-RPC traffic between the two.
//!
//! The hard part is staying alive and correct on unreliable networks: both
//! legs reconnect independently with capped, jittered backoff; a liveness
//! monitor pings the remote peer and forces a reconnect when it goes silent;
//! and outbound posts follow the gateway's dynamically announced per-message
//! reply endpoints, falling back through a ladder of candidates when the
//! session-scoped endpoints rotate mid-flight.
//!
//! Collaborators drive a [`BridgeCoordinator`]: `start`, `reconnect`,
//! `shutdown`, `send_message`, and a polled [`BridgeStatus`] snapshot.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod mcp;
pub mod relay;
pub mod sse;
pub mod status;
pub mod xiaozhi;

pub use backoff::BackoffPolicy;
pub use config::BridgeConfig;
pub use coordinator::BridgeCoordinator;
pub use endpoint::EndpointResolver;
pub use envelope::RpcEnvelope;
pub use error::{BridgeError, BridgeResult};
pub use status::{BridgeState, BridgeStatus, ConnectionState};
