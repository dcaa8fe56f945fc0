//! Service entry point: turns a connected transport into a live peer.

use tracing::info;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::mailbox::mailbox;
use crate::peer::{self, PeerLink, PeerTask};
use crate::peer_id::PeerIdAllocator;
use crate::registry::{Registry, RegistryHandle};
use crate::transport::Transport;

/// A running relay. Cheap to clone; clones share the registry.
#[derive(Debug, Clone)]
pub struct Relay {
    registry: RegistryHandle,
    ids: PeerIdAllocator,
    config: RelayConfig,
}

impl Relay {
    /// Validate `config` and start the registry loop on the current runtime.
    pub fn start(config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let registry = Registry::spawn(config.intake_capacity, config.overflow);
        info!(
            "Relay started (pong wait {:?}, ping period {:?}, mailbox {})",
            config.keepalive.pong_wait(),
            config.keepalive.ping_period(),
            config.mailbox_capacity
        );

        Ok(Self {
            registry,
            ids: PeerIdAllocator::new(),
            config,
        })
    }

    /// Register a new peer for `transport` and start its loops.
    ///
    /// Returns as soon as the registry has accepted the peer. On error no
    /// peer exists and the transport is dropped.
    pub async fn attach<T: Transport>(&self, transport: T) -> Result<PeerTask> {
        let id = self.ids.next_id();
        let (mailbox, outbox) = mailbox(self.config.mailbox_capacity);
        let link = PeerLink::new(id);

        self.registry.register(id, mailbox).await?;
        link.mark_live();

        Ok(peer::spawn(
            transport,
            outbox,
            self.registry.clone(),
            link,
            self.config.keepalive,
        ))
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}
