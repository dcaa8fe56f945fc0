//! Relay configuration: keepalive timing, mailbox sizing and overflow policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::OverflowPolicy;

/// Default time allowed to write a frame to a peer.
pub const DEFAULT_WRITE_WAIT_MS: u64 = 10_000;

/// Default time allowed between liveness signals (data or pong) from a peer.
pub const DEFAULT_PONG_WAIT_MS: u64 = 60_000;

/// Default number of frames a peer may have queued before it counts as slow.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Default capacity of the registry's command intake.
pub const DEFAULT_INTAKE_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("ping period ({ping_period_ms}ms) must be shorter than pong wait ({pong_wait_ms}ms)")]
    PingPeriodTooLong {
        ping_period_ms: u64,
        pong_wait_ms: u64,
    },

    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
}

/// Keepalive timing contract enforced inside every peer.
///
/// A ping is always sent before the read deadline it refreshes can expire,
/// so `ping_period_ms` must be strictly less than `pong_wait_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Upper bound on any single write, ping and close included (default: 10s)
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    /// Read deadline window, re-armed on data and pong (default: 60s)
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Interval between pings (default: 9/10 of pong wait)
    #[serde(default = "default_ping_period")]
    pub ping_period_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: default_write_wait(),
            pong_wait_ms: default_pong_wait(),
            ping_period_ms: default_ping_period(),
        }
    }
}

impl KeepaliveConfig {
    /// Build a config whose ping period is nine tenths of `pong_wait`.
    pub fn from_pong_wait(pong_wait: Duration, write_wait: Duration) -> Self {
        let pong_wait_ms = millis(pong_wait);
        Self {
            write_wait_ms: millis(write_wait),
            pong_wait_ms,
            ping_period_ms: ping_period_for(pong_wait_ms),
        }
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_wait_ms == 0 {
            return Err(ConfigError::ZeroDuration("write wait"));
        }
        if self.pong_wait_ms == 0 {
            return Err(ConfigError::ZeroDuration("pong wait"));
        }
        if self.ping_period_ms == 0 {
            return Err(ConfigError::ZeroDuration("ping period"));
        }
        if self.ping_period_ms >= self.pong_wait_ms {
            return Err(ConfigError::PingPeriodTooLong {
                ping_period_ms: self.ping_period_ms,
                pong_wait_ms: self.pong_wait_ms,
            });
        }
        Ok(())
    }
}

/// Main configuration for a relay instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Per-peer outbound queue length (default: 256)
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Registry command queue length (default: 1024)
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,

    /// What to do when a peer's mailbox is full (default: evict the peer)
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keepalive: KeepaliveConfig::default(),
            mailbox_capacity: default_mailbox_capacity(),
            intake_capacity: default_intake_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.keepalive.validate()?;
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("mailbox capacity"));
        }
        if self.intake_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("intake capacity"));
        }
        Ok(())
    }
}

fn ping_period_for(pong_wait_ms: u64) -> u64 {
    // Split to stay in range for any u64
    pong_wait_ms / 10 * 9 + pong_wait_ms % 10 * 9 / 10
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_write_wait() -> u64 {
    DEFAULT_WRITE_WAIT_MS
}

fn default_pong_wait() -> u64 {
    DEFAULT_PONG_WAIT_MS
}

fn default_ping_period() -> u64 {
    ping_period_for(DEFAULT_PONG_WAIT_MS)
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}

fn default_intake_capacity() -> usize {
    DEFAULT_INTAKE_CAPACITY
}
