use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the relay's public entry points.
///
/// Per-peer failures never appear here; they end the peer's loops and are
/// reported through `PeerReport`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Registry is no longer running")]
    RegistryClosed,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
