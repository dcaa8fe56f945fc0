//! Peer actor: one inbound loop and one outbound loop per connection.
//!
//! The inbound loop is the only reader of the transport and the outbound
//! loop is the only writer. They share nothing but a [`PeerLink`], whose
//! state doubles as the transport-closed signal:
//!
//! ```text
//! Registering -> Live -> Draining -> Closed
//! ```
//!
//! Whichever loop first sees a failure closes the transport (`Draining`),
//! which makes the other loop exit. The supervisor task joins both loops and
//! marks the peer `Closed`. Only the inbound loop sends `unregister`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::KeepaliveConfig;
use crate::mailbox::Outbox;
use crate::peer_id::PeerId;
use crate::registry::RegistryHandle;
use crate::transport::{self, Frame, FrameKind, FrameReader, FrameWriter, Transport, TransportError};

/// Lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    /// Waiting for the registry to accept the registration
    Registering,
    /// Registered, both loops running
    Live,
    /// Transport closed, loops winding down
    Draining,
    /// Both loops have exited
    Closed,
}

/// Why the inbound loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundExit {
    /// The remote end sent a close frame
    PeerClosed,
    ReadFailed(TransportError),
    /// No data or pong within the pong wait
    ReadTimeout,
    /// The outbound loop closed the transport
    TransportClosed,
    RegistryClosed,
    /// The loop panicked or was cancelled
    Aborted,
}

impl InboundExit {
    /// Whether the loop stopped on a transport fault rather than a normal
    /// hang-up, timeout or teardown.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            InboundExit::ReadFailed(TransportError::Io(_) | TransportError::Protocol(_))
                | InboundExit::Aborted
        )
    }
}

/// Why the outbound loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundExit {
    /// The registry closed the mailbox
    Unregistered,
    WriteFailed(TransportError),
    WriteTimeout,
    /// The inbound loop closed the transport
    TransportClosed,
    /// The loop panicked or was cancelled
    Aborted,
}

/// Outcome of a finished peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReport {
    pub id: PeerId,
    pub inbound: InboundExit,
    pub outbound: OutboundExit,
}

/// State shared by a peer's two loops.
#[derive(Debug)]
pub struct PeerLink {
    id: PeerId,
    state: watch::Sender<PeerState>,
}

impl PeerLink {
    pub fn new(id: PeerId) -> Arc<Self> {
        let (state, _) = watch::channel(PeerState::Registering);
        Arc::new(Self { id, state })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    pub fn mark_live(&self) {
        self.advance(PeerState::Live);
    }

    /// Close the transport. Returns `true` only for the call that actually
    /// closed it; later calls are no-ops.
    pub fn close_transport(&self) -> bool {
        let closed = self.advance(PeerState::Draining);
        if closed {
            debug!(peer = %self.id, "Transport closed");
        }
        closed
    }

    fn mark_closed(&self) {
        self.advance(PeerState::Closed);
    }

    fn advance(&self, next: PeerState) -> bool {
        self.state.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once the transport has been closed.
    fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx.wait_for(|state| *state >= PeerState::Draining).await;
        }
    }
}

/// Handle to a running peer. Dropping it detaches the peer.
#[derive(Debug)]
pub struct PeerTask {
    id: PeerId,
    state: watch::Receiver<PeerState>,
    supervisor: JoinHandle<PeerReport>,
}

impl PeerTask {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Wait until both loops have exited and the peer is closed.
    pub async fn join(self) -> PeerReport {
        match self.supervisor.await {
            Ok(report) => report,
            Err(e) => {
                warn!(peer = %self.id, "Peer supervisor failed: {}", e);
                PeerReport {
                    id: self.id,
                    inbound: InboundExit::Aborted,
                    outbound: OutboundExit::Aborted,
                }
            }
        }
    }
}

/// Start both loops for a registered peer.
pub(crate) fn spawn<T: Transport>(
    transport: T,
    outbox: Outbox,
    registry: RegistryHandle,
    link: Arc<PeerLink>,
    keepalive: KeepaliveConfig,
) -> PeerTask {
    let id = link.id();
    let (reader, writer) = transport.split();

    let mut inbound = tokio::spawn(inbound_loop(
        id,
        reader,
        registry.clone(),
        link.clone(),
        keepalive.pong_wait(),
    ));
    let mut outbound = tokio::spawn(outbound_loop(id, writer, outbox, link.clone(), keepalive));

    let state = link.subscribe();
    let supervisor = tokio::spawn(async move {
        // Whichever loop dies first must not leave the other one waiting
        let (inbound, outbound) = tokio::select! {
            result = &mut inbound => {
                if result.is_err() {
                    link.close_transport();
                }
                (result, outbound.await)
            }
            result = &mut outbound => {
                if result.is_err() {
                    link.close_transport();
                }
                (inbound.await, result)
            }
        };

        let inbound = match inbound {
            Ok(exit) => exit,
            Err(e) => {
                warn!(peer = %id, "Inbound loop failed: {}", e);
                let _ = registry.unregister(id).await;
                InboundExit::Aborted
            }
        };
        let outbound = match outbound {
            Ok(exit) => exit,
            Err(e) => {
                warn!(peer = %id, "Outbound loop failed: {}", e);
                OutboundExit::Aborted
            }
        };

        link.mark_closed();
        info!(peer = %id, ?inbound, ?outbound, "Peer disconnected");

        PeerReport {
            id,
            inbound,
            outbound,
        }
    });

    PeerTask {
        id,
        state,
        supervisor,
    }
}

/// Reads frames until the first failure and forwards data to the registry.
async fn inbound_loop<R: FrameReader>(
    id: PeerId,
    mut reader: R,
    registry: RegistryHandle,
    link: Arc<PeerLink>,
    pong_wait: Duration,
) -> InboundExit {
    let closed = link.closed();
    tokio::pin!(closed);

    let mut deadline = Instant::now() + pong_wait;

    let exit = loop {
        let read = tokio::select! {
            _ = &mut closed => break InboundExit::TransportClosed,
            read = timeout_at(deadline, reader.read_frame()) => read,
        };

        let frame = match read {
            Err(_) => break InboundExit::ReadTimeout,
            Ok(Err(e)) => break InboundExit::ReadFailed(e),
            Ok(Ok(frame)) => frame,
        };

        match frame.kind {
            FrameKind::Text | FrameKind::Binary => {
                deadline = Instant::now() + pong_wait;
                trace!(peer = %id, bytes = frame.payload.len(), "Received frame");
                if registry.broadcast(frame).await.is_err() {
                    break InboundExit::RegistryClosed;
                }
            }
            FrameKind::Pong => {
                deadline = Instant::now() + pong_wait;
            }
            // Answered by the transport itself
            FrameKind::Ping => {}
            FrameKind::Close => break InboundExit::PeerClosed,
        }
    };

    match &exit {
        InboundExit::ReadFailed(e) if exit.is_unexpected() => {
            warn!(peer = %id, "Read failed: {}", e)
        }
        InboundExit::ReadFailed(e) => debug!(peer = %id, "Read failed: {}", e),
        InboundExit::ReadTimeout => debug!(peer = %id, "No data or pong within {:?}", pong_wait),
        _ => {}
    }

    let _ = registry.unregister(id).await;
    link.close_transport();
    exit
}

/// Drains the mailbox to the transport and keeps the connection alive.
async fn outbound_loop<W: FrameWriter>(
    id: PeerId,
    mut writer: W,
    mut outbox: Outbox,
    link: Arc<PeerLink>,
    keepalive: KeepaliveConfig,
) -> OutboundExit {
    let write_wait = keepalive.write_wait();
    let ping_period = keepalive.ping_period();

    let closed = link.closed();
    tokio::pin!(closed);

    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            _ = &mut closed => break OutboundExit::TransportClosed,
            next = outbox.recv() => {
                let Some(frame) = next else {
                    // Mailbox closed by the registry
                    if let Err(exit) = bounded(write_wait, writer.write_frame(Frame::close())).await {
                        debug!(peer = %id, ?exit, "Close frame not delivered");
                    }
                    break OutboundExit::Unregistered;
                };

                let mut batch = vec![frame];
                outbox.drain_ready(&mut batch);
                let count = batch.len();

                if let Err(exit) = bounded(write_wait, writer.write_batch(batch)).await {
                    break exit;
                }
                trace!(peer = %id, frames = count, "Flushed frames");
            }
            _ = ticker.tick() => {
                if let Err(exit) = bounded(write_wait, writer.write_frame(Frame::ping())).await {
                    break exit;
                }
                trace!(peer = %id, "Sent ping");
            }
        }
    };

    if let OutboundExit::WriteFailed(_) | OutboundExit::WriteTimeout = exit {
        debug!(peer = %id, ?exit, "Write failed");
    }

    link.close_transport();
    if let Err(exit) = bounded(write_wait, writer.close()).await {
        trace!(peer = %id, ?exit, "Transport shutdown incomplete");
    }
    exit
}

/// Run a write under the write deadline.
async fn bounded<F>(write_wait: Duration, write: F) -> Result<(), OutboundExit>
where
    F: Future<Output = transport::Result<()>>,
{
    match timeout(write_wait, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(OutboundExit::WriteFailed(e)),
        Err(_) => Err(OutboundExit::WriteTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::mailbox::mailbox;
    use crate::memory::{self, MemoryClient, MemoryReader};
    use crate::policy::OverflowPolicy;
    use crate::registry::Registry;

    fn keepalive(pong_wait_ms: u64, ping_period_ms: u64) -> KeepaliveConfig {
        KeepaliveConfig {
            write_wait_ms: 1_000,
            pong_wait_ms,
            ping_period_ms,
        }
    }

    async fn start_peer(
        registry: &RegistryHandle,
        raw_id: u64,
        keepalive: KeepaliveConfig,
    ) -> (PeerTask, MemoryClient) {
        let (transport, client) = memory::pair(16);
        let task = start_peer_with(registry, raw_id, transport, keepalive).await;
        (task, client)
    }

    async fn start_peer_with<T: Transport>(
        registry: &RegistryHandle,
        raw_id: u64,
        transport: T,
        keepalive: KeepaliveConfig,
    ) -> PeerTask {
        let id = PeerId::from_raw(raw_id);
        let (mailbox, outbox) = mailbox(16);
        let link = PeerLink::new(id);

        registry.register(id, mailbox).await.unwrap();
        link.mark_live();

        spawn(transport, outbox, registry.clone(), link, keepalive)
    }

    /// Reads from a memory pair, panics on the first write.
    struct PanickingTransport {
        reader: MemoryReader,
    }

    struct PanickingWriter;

    impl Transport for PanickingTransport {
        type Reader = MemoryReader;
        type Writer = PanickingWriter;

        fn split(self) -> (MemoryReader, PanickingWriter) {
            (self.reader, PanickingWriter)
        }
    }

    #[async_trait]
    impl FrameWriter for PanickingWriter {
        async fn write_frame(&mut self, _frame: Frame) -> transport::Result<()> {
            panic!("writer failed");
        }

        async fn close(&mut self) -> transport::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unexpected_exits() {
        assert!(InboundExit::ReadFailed(TransportError::Io("reset".into())).is_unexpected());
        assert!(InboundExit::ReadFailed(TransportError::Protocol("bad frame".into())).is_unexpected());
        assert!(InboundExit::Aborted.is_unexpected());

        assert!(!InboundExit::ReadFailed(TransportError::Closed).is_unexpected());
        assert!(!InboundExit::PeerClosed.is_unexpected());
        assert!(!InboundExit::ReadTimeout.is_unexpected());
        assert!(!InboundExit::TransportClosed.is_unexpected());
    }

    #[test]
    fn test_close_transport_only_once() {
        let link = PeerLink::new(PeerId::from_raw(1));
        link.mark_live();

        assert!(link.close_transport());
        assert!(!link.close_transport());
        assert_eq!(link.state(), PeerState::Draining);

        // Never moves backwards
        link.mark_live();
        assert_eq!(link.state(), PeerState::Draining);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let registry = Registry::spawn(16, OverflowPolicy::EvictPeer);
        let (task, client) = start_peer(&registry, 1, keepalive(150, 100)).await;
        assert_eq!(task.state(), PeerState::Live);

        let report = task.join().await;

        assert_eq!(report.inbound, InboundExit::ReadTimeout);
        assert!(registry.live_peers().await.unwrap().is_empty());
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn test_pongs_keep_peer_alive() {
        let registry = Registry::spawn(16, OverflowPolicy::EvictPeer);
        let (task, mut client) = start_peer(&registry, 1, keepalive(300, 100)).await;

        // Answer pings for several read windows
        let answered = tokio::time::timeout(Duration::from_millis(1_000), async {
            let mut pings = 0;
            while let Some(frame) = client.recv().await {
                if frame.kind == FrameKind::Ping {
                    pings += 1;
                    client.send(Frame::pong()).await.unwrap();
                }
            }
            pings
        })
        .await;
        assert!(answered.is_err(), "peer should still be connected");

        assert_eq!(
            registry.live_peers().await.unwrap(),
            vec![PeerId::from_raw(1)]
        );
        assert_eq!(task.state(), PeerState::Live);

        // Hanging up ends the peer through the inbound loop
        client.hang_up();
        let report = task.join().await;
        assert_eq!(report.inbound, InboundExit::ReadFailed(TransportError::Closed));
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn test_data_frames_keep_peer_alive() {
        let registry = Registry::spawn(16, OverflowPolicy::EvictPeer);
        // Room for every unread echo and ping
        let (transport, client) = memory::pair(64);
        let task = start_peer_with(&registry, 1, transport, keepalive(300, 100)).await;

        // Pings and echoes are never read; only data arrives from the client
        for i in 0..8 {
            client.send(Frame::text(format!("tick-{}", i))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        assert_eq!(task.state(), PeerState::Live);
        assert_eq!(
            registry.live_peers().await.unwrap(),
            vec![PeerId::from_raw(1)]
        );

        // Once the data stops the read deadline expires
        let report = task.join().await;
        assert_eq!(report.inbound, InboundExit::ReadTimeout);
    }

    #[tokio::test]
    async fn test_outbound_panic_stops_inbound() {
        let registry = Registry::spawn(16, OverflowPolicy::EvictPeer);
        let (transport, client) = memory::pair(16);
        let (reader, _writer) = transport.split();
        let task = start_peer_with(
            &registry,
            1,
            PanickingTransport { reader },
            keepalive(5_000, 4_000),
        )
        .await;

        // The echo reaches the writer, which panics
        client.send(Frame::text("boom")).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), task.join())
            .await
            .expect("inbound loop should not wait for the read deadline");
        assert_eq!(report.outbound, OutboundExit::Aborted);
        assert_eq!(report.inbound, InboundExit::TransportClosed);
        assert!(registry.live_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_sends_close_frame() {
        let registry = Registry::spawn(16, OverflowPolicy::EvictPeer);
        let (task, mut client) = start_peer(&registry, 1, keepalive(5_000, 4_000)).await;

        registry.unregister(PeerId::from_raw(1)).await.unwrap();

        assert_eq!(client.recv().await, Some(Frame::close()));
        let report = task.join().await;
        assert_eq!(report.outbound, OutboundExit::Unregistered);
        assert_eq!(report.inbound, InboundExit::TransportClosed);
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_frame_from_remote_unregisters() {
        let registry = Registry::spawn(16, OverflowPolicy::EvictPeer);
        let (task, client) = start_peer(&registry, 1, keepalive(5_000, 4_000)).await;

        client.send(Frame::close()).await.unwrap();

        let report = task.join().await;
        assert_eq!(report.inbound, InboundExit::PeerClosed);
        assert!(registry.live_peers().await.unwrap().is_empty());
        assert_eq!(registry.stats().await.unwrap().unregistered, 1);
    }

    #[tokio::test]
    async fn test_write_failure_tears_down_through_inbound() {
        let registry = Registry::spawn(16, OverflowPolicy::EvictPeer);
        let (task, mut client) = start_peer(&registry, 1, keepalive(5_000, 4_000)).await;
        let (_sender_task, sender) = start_peer(&registry, 2, keepalive(5_000, 4_000)).await;

        client.stop_receiving();
        sender.send(Frame::text("ping?")).await.unwrap();

        let report = task.join().await;
        assert_eq!(
            report.outbound,
            OutboundExit::WriteFailed(TransportError::Closed)
        );
        assert_eq!(report.inbound, InboundExit::TransportClosed);
        assert_eq!(
            registry.live_peers().await.unwrap(),
            vec![PeerId::from_raw(2)]
        );
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn test_data_is_broadcast_back_to_sender() {
        let registry = Registry::spawn(16, OverflowPolicy::EvictPeer);
        let (_task, mut client) = start_peer(&registry, 1, keepalive(5_000, 4_000)).await;

        client.send(Frame::binary(vec![0xde, 0xad])).await.unwrap();

        assert_eq!(
            client.recv_data().await,
            Some(Frame::binary(vec![0xde, 0xad]))
        );
    }
}
