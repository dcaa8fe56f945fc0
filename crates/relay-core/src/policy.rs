//! Backpressure policy for full mailboxes.
//!
//! The registry never waits on a peer. When a mailbox has no room for a
//! broadcast frame the policy decides whether the peer is sacrificed or
//! only the frame is.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Policy applied when a broadcast finds a peer's mailbox full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Treat the peer as dead: close its mailbox and remove it immediately.
    #[default]
    EvictPeer,
    /// Skip this frame for the slow peer and keep it registered.
    DropFrame,
}

/// What the registry does with one peer after a failed enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowAction {
    Evict,
    Skip,
}

impl OverflowPolicy {
    pub fn on_full(self) -> OverflowAction {
        match self {
            OverflowPolicy::EvictPeer => OverflowAction::Evict,
            OverflowPolicy::DropFrame => OverflowAction::Skip,
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::EvictPeer => f.write_str("evict-peer"),
            OverflowPolicy::DropFrame => f.write_str("drop-frame"),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evict-peer" => Ok(OverflowPolicy::EvictPeer),
            "drop-frame" => Ok(OverflowPolicy::DropFrame),
            other => Err(format!(
                "unknown overflow policy '{}' (expected evict-peer or drop-frame)",
                other
            )),
        }
    }
}
