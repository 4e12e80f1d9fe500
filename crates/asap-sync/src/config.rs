//! Configuration for engines, sessions and encounters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of eras kept in the chunk store, including the open one.
    /// Values below 2 are treated as 2.
    pub max_eras: u32,
    /// Whether chunks received from third parties are re-offered.
    pub routing_allowed: bool,
    /// Remove closed chunks once every recipient has received them.
    pub drop_delivered: bool,
}

impl EngineConfig {
    /// Effective retention window.
    pub fn retained_eras(&self) -> u64 {
        self.max_eras.max(2) as u64
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_eras: 16,
            routing_allowed: true,
            drop_delivered: false,
        }
    }
}

/// Configuration for sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A session that receives nothing for this long is terminated. The same
    /// limit bounds storing one incoming PDU and writing one outgoing PDU.
    pub read_timeout: Duration,
    /// Largest accepted ASSIMILATE payload.
    pub max_payload_len: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            max_payload_len: 64 * 1024 * 1024,
        }
    }
}

/// Configuration for encounter admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncounterConfig {
    /// Minimum time between two encounters with the same peer.
    pub cool_down: Duration,
    /// Run the tie-break exchange, for transports where both sides may dial
    /// each other at the same moment.
    pub double_connect_prone: bool,
    /// How long the losing initiator waits before re-checking admission.
    pub tie_break_delay: Duration,
    /// Deadline for the id and tie-break exchange.
    pub handshake_timeout: Duration,
}

impl Default for EncounterConfig {
    fn default() -> Self {
        Self {
            cool_down: Duration::from_secs(60),
            double_connect_prone: false,
            tie_break_delay: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
