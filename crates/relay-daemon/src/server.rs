//! WebSocket server feeding accepted connections into the relay.
//!
//! Each accepted TCP connection is upgraded on its own task, so a slow or
//! stalled handshake never holds up the accept loop. Upgrade failures are
//! logged and dropped; only a completed handshake creates a peer.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_core::{PeerTask, Relay};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::ws::WsTransport;

/// Maximum size of one incoming message (64MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Upgrade-layer settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Request path that accepts upgrades (default: "/ws")
    pub path: String,
    /// Time allowed to complete the WebSocket handshake (default: 8s)
    pub handshake_timeout: Duration,
    /// Largest message accepted from a client
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            handshake_timeout: Duration::from_secs(8),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Accepts WebSocket clients and attaches them to a [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayServer {
    relay: Relay,
    config: Arc<ServerConfig>,
}

impl RelayServer {
    pub fn new(relay: Relay, config: ServerConfig) -> Self {
        Self {
            relay,
            config: Arc::new(config),
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", listen_addr))?;
        info!("WebSocket server listening on {}", listen_addr);
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.accept_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Upgrade and attach `stream` in the background.
    ///
    /// Returns immediately. The handle resolves to the new peer, or `None`
    /// if the handshake failed and no peer was created.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) -> JoinHandle<Option<PeerTask>> {
        let server = self.clone();
        tokio::spawn(async move { server.upgrade_and_attach(stream, addr).await })
    }

    async fn upgrade_and_attach(self, stream: TcpStream, addr: SocketAddr) -> Option<PeerTask> {
        let path = self.config.path.clone();
        let check_path = move |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            if request.uri().path() == path {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);

        let upgrade = accept_hdr_async_with_config(stream, check_path, Some(ws_config));
        let ws_stream = match timeout(self.config.handshake_timeout, upgrade).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                // Health checks (like `nc -z`) connect and immediately close without
                // completing the WebSocket handshake. Log these as debug, not warn.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    warn!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return None;
            }
            Err(_) => {
                debug!(
                    "Handshake from {} not completed within {:?}",
                    addr, self.config.handshake_timeout
                );
                return None;
            }
        };

        match self.relay.attach(WsTransport::new(ws_stream)).await {
            Ok(task) => {
                info!(peer = %task.id(), "New connection from {}", addr);
                Some(task)
            }
            Err(e) => {
                error!("Failed to attach connection from {}: {}", addr, e);
                None
            }
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
