//! relay-daemon: WebSocket fan-out relay.
//!
//! Every message a client sends is broadcast to all connected clients.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use relay_core::{KeepaliveConfig, OverflowPolicy, Relay, RelayConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_daemon::server::{RelayServer, ServerConfig, DEFAULT_MAX_MESSAGE_SIZE};

#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(about = "WebSocket fan-out relay")]
struct Args {
    /// Address to listen on for incoming connections
    #[arg(short, long, env = "RELAY_LISTEN", default_value = "0.0.0.0:8089")]
    listen: String,

    /// Request path that accepts WebSocket upgrades
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Time allowed to write a message to a client (ms)
    #[arg(long, default_value_t = relay_core::config::DEFAULT_WRITE_WAIT_MS)]
    write_wait_ms: u64,

    /// Time allowed between data or pong from a client (ms)
    #[arg(long, default_value_t = relay_core::config::DEFAULT_PONG_WAIT_MS)]
    pong_wait_ms: u64,

    /// Ping interval (ms); defaults to 9/10 of the pong wait
    #[arg(long)]
    ping_period_ms: Option<u64>,

    /// Frames queued per client before it is considered slow
    #[arg(long, default_value_t = relay_core::config::DEFAULT_MAILBOX_CAPACITY)]
    mailbox_capacity: usize,

    /// Capacity of the registry's command queue
    #[arg(long, default_value_t = relay_core::config::DEFAULT_INTAKE_CAPACITY)]
    intake_capacity: usize,

    /// What to do with a slow client: evict-peer or drop-frame
    #[arg(long, default_value_t = OverflowPolicy::EvictPeer)]
    overflow: OverflowPolicy,

    /// Largest message accepted from a client (bytes)
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Time allowed to complete the WebSocket handshake (ms)
    #[arg(long, default_value_t = 8_000)]
    handshake_timeout_ms: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        let mut keepalive = KeepaliveConfig::from_pong_wait(
            Duration::from_millis(self.pong_wait_ms),
            Duration::from_millis(self.write_wait_ms),
        );
        if let Some(ping_period_ms) = self.ping_period_ms {
            keepalive.ping_period_ms = ping_period_ms;
        }

        RelayConfig {
            keepalive,
            mailbox_capacity: self.mailbox_capacity,
            intake_capacity: self.intake_capacity,
            overflow: self.overflow,
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            path: self.path.clone(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_message_size: self.max_message_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,relay_daemon=debug,relay_core=debug"
    } else {
        "info,relay_daemon=info,relay_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting relay-daemon");
    info!("Listen address: {} (path {})", args.listen, args.path);

    let relay = Relay::start(args.relay_config())?;
    let server = RelayServer::new(relay, args.server_config());
    let listener = RelayServer::bind(&args.listen).await?;

    info!("Relay running. Press Ctrl+C to stop.");

    server
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    Ok(())
}
