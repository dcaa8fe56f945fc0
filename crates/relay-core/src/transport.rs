//! Frame transport abstraction for relay peers.
//!
//! A transport is a duplex, message-framed connection that splits into a
//! reader half and a writer half. The inbound loop owns the reader and the
//! outbound loop owns the writer, so neither direction is ever shared.
//!
//! Implementations:
//! - WebSocket: `relay-daemon` adapts `tokio_tungstenite::WebSocketStream`
//! - Memory: [`crate::memory`] channel pairs for embedding and tests
//!
//! Deadlines are not part of the contract. Callers bound each operation
//! with `tokio::time::timeout_at` / `timeout`.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Kind of a single frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// UTF-8 application data
    Text,
    /// Opaque application data
    Binary,
    /// Keepalive probe
    Ping,
    /// Keepalive acknowledgment
    Pong,
    /// Close notification
    Close,
}

impl FrameKind {
    /// Whether frames of this kind carry application data.
    pub fn is_data(self) -> bool {
        matches!(self, FrameKind::Text | FrameKind::Binary)
    }
}

/// A single message-framed unit. The payload is reference counted so
/// fan-out to many mailboxes never copies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Text, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Binary, payload)
    }

    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, Bytes::new())
    }

    pub fn pong() -> Self {
        Self::new(FrameKind::Pong, Bytes::new())
    }

    pub fn close() -> Self {
        Self::new(FrameKind::Close, Bytes::new())
    }

    pub fn is_data(&self) -> bool {
        self.kind.is_data()
    }
}

/// Read half of a transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Read the next frame. Any error is terminal for the connection.
    async fn read_frame(&mut self) -> Result<Frame>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write and flush a single frame.
    async fn write_frame(&mut self, frame: Frame) -> Result<()>;

    /// Write several frames in order, flushing once where the transport
    /// supports it. Frame boundaries are preserved.
    async fn write_batch(&mut self, frames: Vec<Frame>) -> Result<()> {
        for frame in frames {
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    /// Shut down the write direction. Called at most once per transport.
    async fn close(&mut self) -> Result<()>;
}

/// A duplex connection that can be split into independently owned halves.
pub trait Transport: Send + 'static {
    type Reader: FrameReader + 'static;
    type Writer: FrameWriter + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}
