//! Hypha Core - the neural handshake protocol engine.
//!
//! This crate implements:
//! - The per-connection state machine (handshake, heartbeats, context streams)
//! - The connection registry (one authenticated connection per peer)
//! - Listener registration for authentication and context events
//! - The `Node` façade tying identity, discovery and metrics together
//! - Configuration loading and validation

#![forbid(unsafe_code)]

// Protocol engine
pub mod connection;
pub mod registry;
pub mod node;

// Services
pub mod listeners;

// Supporting modules
pub mod config;
pub mod errors;

pub use config::{ConnectionConfig, NodeConfig};
pub use connection::ConnectionHandle;
pub use errors::{CloseReason, ConfigError, ConnectionError, NodeError};
pub use listeners::{ListenerHandle, Listeners};
pub use node::Node;
pub use registry::ConnectionRegistry;
