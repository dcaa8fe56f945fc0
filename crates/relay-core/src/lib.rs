//! relay-core: actor-per-connection fan-out relay.
//!
//! Every frame a peer sends is broadcast to all live peers. This crate
//! provides:
//! - A single-owner registry loop that serializes membership and fan-out
//! - Per-peer inbound/outbound loops with keepalive and deadlines
//! - Bounded mailboxes with a named overflow policy
//! - The `Transport` trait abstraction plus an in-memory implementation

pub mod config;
pub mod error;
pub mod mailbox;
pub mod memory;
pub mod peer;
pub mod peer_id;
pub mod policy;
pub mod registry;
pub mod relay;
pub mod transport;

pub use config::{ConfigError, KeepaliveConfig, RelayConfig};
pub use error::RelayError;
pub use mailbox::{Mailbox, Offer, Outbox};
pub use peer::{InboundExit, OutboundExit, PeerReport, PeerState, PeerTask};
pub use peer_id::PeerId;
pub use policy::OverflowPolicy;
pub use registry::{RegistryHandle, RegistryStats};
pub use relay::Relay;
pub use transport::{Frame, FrameKind, FrameReader, FrameWriter, Transport, TransportError};
