//! Bounded per-peer outbound queues.
//!
//! The registry holds the producing [`Mailbox`]; the peer's outbound loop
//! holds the consuming [`Outbox`]. Dropping the `Mailbox` closes the queue:
//! frames already queued are still delivered, then `recv` returns `None`.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::transport::Frame;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// No room left; the consumer is not keeping up
    Full,
    /// The consumer is gone
    Closed,
}

/// Producer side of a peer's queue.
#[derive(Debug)]
pub struct Mailbox {
    tx: mpsc::Sender<Frame>,
}

/// Consumer side of a peer's queue.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<Frame>,
    capacity: usize,
}

/// Create a mailbox holding at most `capacity` unconsumed frames.
pub fn mailbox(capacity: usize) -> (Mailbox, Outbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (Mailbox { tx }, Outbox { rx, capacity })
}

impl Mailbox {
    /// Try to enqueue without waiting.
    pub fn offer(&self, frame: Frame) -> Offer {
        match self.tx.try_send(frame) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => Offer::Full,
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Outbox {
    /// Wait for the next frame. `None` once the mailbox is closed and empty.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Move frames that are already queued into `batch`, in enqueue order,
    /// without waiting. Takes at most one mailbox worth per call.
    pub fn drain_ready(&mut self, batch: &mut Vec<Frame>) {
        while batch.len() < self.capacity {
            match self.rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
