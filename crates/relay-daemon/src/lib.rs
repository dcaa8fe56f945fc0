//! relay-daemon library: exposes the WebSocket server for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod server;
pub mod ws;

// Re-export key types for convenience
pub use server::{RelayServer, ServerConfig, DEFAULT_MAX_MESSAGE_SIZE};
pub use ws::WsTransport;
