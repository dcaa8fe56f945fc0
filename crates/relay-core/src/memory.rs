//! In-process transport backed by bounded channels.
//!
//! [`pair`] returns the relay side ([`MemoryTransport`]) and the remote side
//! ([`MemoryClient`]). Each direction holds at most `capacity` frames, so a
//! client that stops reading eventually blocks the relay's writes, the same
//! way a stalled TCP peer does.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{Frame, FrameKind, FrameReader, FrameWriter, Result, Transport, TransportError};

/// Create a connected transport/client pair.
pub fn pair(capacity: usize) -> (MemoryTransport, MemoryClient) {
    let (to_relay, incoming) = mpsc::channel(capacity);
    let (outgoing, from_relay) = mpsc::channel(capacity);
    let closes = Arc::new(AtomicUsize::new(0));

    let transport = MemoryTransport {
        incoming,
        outgoing,
        closes: closes.clone(),
    };
    let client = MemoryClient {
        to_relay: Some(to_relay),
        from_relay: Some(from_relay),
        closes,
    };
    (transport, client)
}

/// Relay side of a memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    incoming: mpsc::Receiver<Frame>,
    outgoing: mpsc::Sender<Frame>,
    closes: Arc<AtomicUsize>,
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (MemoryReader, MemoryWriter) {
        (
            MemoryReader {
                incoming: self.incoming,
            },
            MemoryWriter {
                outgoing: Some(self.outgoing),
                closes: self.closes,
            },
        )
    }
}

#[derive(Debug)]
pub struct MemoryReader {
    incoming: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Result<Frame> {
        self.incoming.recv().await.ok_or(TransportError::Closed)
    }
}

#[derive(Debug)]
pub struct MemoryWriter {
    outgoing: Option<mpsc::Sender<Frame>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        outgoing
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.outgoing.take();
        Ok(())
    }
}

/// Remote side of a memory connection.
#[derive(Debug)]
pub struct MemoryClient {
    to_relay: Option<mpsc::Sender<Frame>>,
    from_relay: Option<mpsc::Receiver<Frame>>,
    closes: Arc<AtomicUsize>,
}

impl MemoryClient {
    /// Send a frame to the relay.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let to_relay = self.to_relay.as_ref().ok_or(TransportError::Closed)?;
        to_relay
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next frame written by the relay, control frames included.
    /// `None` once the relay has shut down its write side.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_relay.as_mut()?.recv().await
    }

    /// Next data frame. Pings are answered, pongs skipped; `None` on a close
    /// frame or once the relay has shut down its write side.
    pub async fn recv_data(&mut self) -> Option<Frame> {
        loop {
            let frame = self.recv().await?;
            match frame.kind {
                FrameKind::Text | FrameKind::Binary => return Some(frame),
                FrameKind::Ping => {
                    let _ = self.send(Frame::pong()).await;
                }
                FrameKind::Pong => {}
                FrameKind::Close => return None,
            }
        }
    }

    /// Stop sending; the relay's next read fails with `Closed`.
    pub fn hang_up(&mut self) {
        self.to_relay.take();
    }

    /// Stop reading; the relay's next write fails with `Closed`.
    pub fn stop_receiving(&mut self) {
        self.from_relay.take();
    }

    /// How many times the relay shut down its write side.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}
