//! Registry and broadcaster.
//!
//! A single task owns the set of live peers. Registration, unregistration
//! and broadcast all arrive as [`Command`]s on one intake queue and are
//! handled one at a time, so membership changes are totally ordered without
//! any lock. Nothing outside the task can reach the set.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{RelayError, Result};
use crate::mailbox::{Mailbox, Offer};
use crate::peer_id::PeerId;
use crate::policy::{OverflowAction, OverflowPolicy};
use crate::transport::Frame;

/// Message accepted by the registry loop.
#[derive(Debug)]
pub enum Command {
    /// Add a peer to the live set
    Register { id: PeerId, mailbox: Mailbox },
    /// Remove a peer and close its mailbox; no-op if already gone
    Unregister { id: PeerId },
    /// Offer a frame to every live peer
    Broadcast { frame: Frame },
    /// Report the live peer ids, sorted
    Snapshot { reply: oneshot::Sender<Vec<PeerId>> },
    /// Report counters
    Stats { reply: oneshot::Sender<RegistryStats> },
}

/// Counters kept by the registry loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Peers currently live
    pub live: usize,
    pub registered: u64,
    /// Peers removed by an unregister request
    pub unregistered: u64,
    /// Peers removed during a broadcast (slow or gone consumer)
    pub evicted: u64,
    pub broadcasts: u64,
    /// Frames successfully queued into a mailbox
    pub deliveries: u64,
    /// Frames skipped under `OverflowPolicy::DropFrame`
    pub dropped_frames: u64,
}

/// State owned by the registry loop.
pub struct Registry {
    peers: HashMap<PeerId, Mailbox>,
    policy: OverflowPolicy,
    stats: RegistryStats,
}

impl Registry {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            peers: HashMap::new(),
            policy,
            stats: RegistryStats::default(),
        }
    }

    /// Start the registry loop on the current runtime.
    ///
    /// The loop runs until every [`RegistryHandle`] has been dropped.
    pub fn spawn(intake_capacity: usize, policy: OverflowPolicy) -> RegistryHandle {
        let (tx, rx) = mpsc::channel(intake_capacity);
        tokio::spawn(Self::new(policy).run(rx));
        RegistryHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("Registry started (overflow policy: {})", self.policy);
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!("Registry stopped with {} live peer(s)", self.peers.len());
    }

    /// Apply one command. Never fails.
    pub fn handle(&mut self, command: Command) {
        match command {
            Command::Register { id, mailbox } => self.register(id, mailbox),
            Command::Unregister { id } => self.unregister(id),
            Command::Broadcast { frame } => self.broadcast(frame),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.live_peers());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn register(&mut self, id: PeerId, mailbox: Mailbox) {
        self.peers.insert(id, mailbox);
        self.stats.registered += 1;
        debug!(peer = %id, live = self.peers.len(), "Registered");
    }

    fn unregister(&mut self, id: PeerId) {
        // Dropping the mailbox closes it; the outbound loop sends the close frame.
        if self.peers.remove(&id).is_some() {
            self.stats.unregistered += 1;
            debug!(peer = %id, live = self.peers.len(), "Unregistered");
        } else {
            trace!(peer = %id, "Unregister for absent peer ignored");
        }
    }

    fn broadcast(&mut self, frame: Frame) {
        self.stats.broadcasts += 1;

        let mut evicted = Vec::new();
        for (id, mailbox) in &self.peers {
            match mailbox.offer(frame.clone()) {
                Offer::Queued => self.stats.deliveries += 1,
                Offer::Full => match self.policy.on_full() {
                    OverflowAction::Evict => {
                        warn!(peer = %id, "Mailbox full, evicting slow peer");
                        evicted.push(*id);
                    }
                    OverflowAction::Skip => {
                        debug!(peer = %id, "Mailbox full, dropping frame");
                        self.stats.dropped_frames += 1;
                    }
                },
                Offer::Closed => {
                    debug!(peer = %id, "Mailbox consumer gone, removing peer");
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            self.peers.remove(&id);
            self.stats.evicted += 1;
        }
    }

    pub fn live_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.peers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live: self.peers.len(),
            ..self.stats
        }
    }
}

/// Cloneable submission side of the registry loop.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    async fn submit(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| RelayError::RegistryClosed)
    }

    /// Returns once the registry has accepted the request.
    pub async fn register(&self, id: PeerId, mailbox: Mailbox) -> Result<()> {
        self.submit(Command::Register { id, mailbox }).await
    }

    pub async fn unregister(&self, id: PeerId) -> Result<()> {
        self.submit(Command::Unregister { id }).await
    }

    pub async fn broadcast(&self, frame: Frame) -> Result<()> {
        self.submit(Command::Broadcast { frame }).await
    }

    pub async fn live_peers(&self) -> Result<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| RelayError::RegistryClosed)
    }

    pub async fn peer_count(&self) -> Result<usize> {
        Ok(self.stats().await?.live)
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Stats { reply }).await?;
        rx.await.map_err(|_| RelayError::RegistryClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{mailbox, Outbox};
    use std::collections::BTreeSet;

    fn id(n: u64) -> PeerId {
        PeerId::from_raw(n)
    }

    fn register(registry: &mut Registry, n: u64, capacity: usize) -> Outbox {
        let (mailbox, outbox) = mailbox(capacity);
        registry.handle(Command::Register { id: id(n), mailbox });
        outbox
    }

    fn broadcast(registry: &mut Registry, text: &'static str) {
        registry.handle(Command::Broadcast {
            frame: Frame::text(text),
        });
    }

    async fn texts(outbox: &mut Outbox) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(frame) = outbox.recv().await {
            out.push(String::from_utf8(frame.payload.to_vec()).unwrap());
        }
        out
    }

    // ==================== Membership ====================

    #[test]
    fn test_membership_folds_in_submission_order() {
        let mut registry = Registry::new(OverflowPolicy::EvictPeer);
        let mut expected = BTreeSet::new();
        let mut outboxes = Vec::new();

        // (peer, register?) in submission order
        let ops = [
            (1, true),
            (2, true),
            (1, false),
            (3, true),
            (2, false),
            (2, false),
            (4, true),
            (9, false),
            (1, true),
        ];

        for (n, is_register) in ops {
            if is_register {
                outboxes.push(register(&mut registry, n, 4));
                expected.insert(id(n));
            } else {
                registry.handle(Command::Unregister { id: id(n) });
                expected.remove(&id(n));
            }
        }

        let live: BTreeSet<_> = registry.live_peers().into_iter().collect();
        assert_eq!(live, expected);
    }

    #[tokio::test]
    async fn test_unregister_closes_mailbox_once() {
        let mut registry = Registry::new(OverflowPolicy::EvictPeer);
        let mut outbox = register(&mut registry, 1, 4);

        registry.handle(Command::Unregister { id: id(1) });
        registry.handle(Command::Unregister { id: id(1) });

        assert!(outbox.recv().await.is_none());
        let stats = registry.stats();
        assert_eq!(stats.unregistered, 1);
        assert_eq!(stats.live, 0);
    }

    // ==================== Broadcast ====================

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer_in_order() {
        let mut registry = Registry::new(OverflowPolicy::EvictPeer);
        let mut outboxes: Vec<_> = (1..=3).map(|n| register(&mut registry, n, 8)).collect();

        broadcast(&mut registry, "one");
        broadcast(&mut registry, "two");
        for n in 1..=3 {
            registry.handle(Command::Unregister { id: id(n) });
        }

        for outbox in &mut outboxes {
            assert_eq!(texts(outbox).await, vec!["one", "two"]);
        }
        assert_eq!(registry.stats().deliveries, 6);
    }

    #[tokio::test]
    async fn test_full_mailbox_evicts_only_slow_peer() {
        let mut registry = Registry::new(OverflowPolicy::EvictPeer);
        let mut slow = register(&mut registry, 1, 1);
        let mut fast = register(&mut registry, 2, 8);

        broadcast(&mut registry, "hi");
        broadcast(&mut registry, "bye");

        assert_eq!(registry.live_peers(), vec![id(2)]);
        assert_eq!(texts(&mut slow).await, vec!["hi"]);

        registry.handle(Command::Unregister { id: id(2) });
        assert_eq!(texts(&mut fast).await, vec!["hi", "bye"]);

        let stats = registry.stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.unregistered, 1);
    }

    #[tokio::test]
    async fn test_drop_frame_policy_keeps_slow_peer() {
        let mut registry = Registry::new(OverflowPolicy::DropFrame);
        let mut slow = register(&mut registry, 1, 1);

        broadcast(&mut registry, "kept");
        broadcast(&mut registry, "dropped");

        assert_eq!(registry.live_peers(), vec![id(1)]);
        assert_eq!(registry.stats().dropped_frames, 1);

        registry.handle(Command::Unregister { id: id(1) });
        assert_eq!(texts(&mut slow).await, vec!["kept"]);
    }

    #[test]
    fn test_broadcast_removes_peer_whose_consumer_is_gone() {
        let mut registry = Registry::new(OverflowPolicy::DropFrame);
        let outbox = register(&mut registry, 1, 4);
        drop(outbox);

        broadcast(&mut registry, "anyone?");

        assert!(registry.live_peers().is_empty());
    }

    // ==================== Loop and handle ====================

    #[tokio::test]
    async fn test_handle_commands_are_serialized() {
        let handle = Registry::spawn(16, OverflowPolicy::EvictPeer);

        let (a, mut a_out) = mailbox(4);
        let (b, _b_out) = mailbox(4);
        handle.register(id(1), a).await.unwrap();
        handle.register(id(2), b).await.unwrap();
        handle.unregister(id(2)).await.unwrap();
        handle.broadcast(Frame::binary(vec![1, 2, 3])).await.unwrap();

        assert_eq!(handle.live_peers().await.unwrap(), vec![id(1)]);
        assert_eq!(handle.peer_count().await.unwrap(), 1);
        assert_eq!(a_out.recv().await, Some(Frame::binary(vec![1, 2, 3])));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.registered, 2);
        assert_eq!(stats.broadcasts, 1);
    }
}
