//! Engine state: the durable checkpoint of one sync engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::era::Era;
use crate::types::{Format, PeerId};

/// Era bookkeeping for one (local peer, format) pair.
///
/// This is everything needed to resume synchronization after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    /// The local peer.
    pub owner: PeerId,

    /// The format this engine serves.
    pub format: Format,

    /// The open era. Content appended now lands here; it is never sent.
    pub era: Era,

    /// Oldest era still retained in the chunk store.
    pub oldest_era: Era,

    /// Whether anything was appended since the last era transition.
    pub content_changed: bool,

    /// Whether chunks received from third parties may be re-offered.
    pub routing_allowed: bool,

    /// Per remote peer: the era up to which it has been synchronized.
    pub last_seen: BTreeMap<PeerId, Era>,
}

impl EngineState {
    /// Fresh state starting at era zero.
    pub fn new(owner: PeerId, format: Format) -> Self {
        Self {
            owner,
            format,
            era: Era::MIN,
            oldest_era: Era::MIN,
            content_changed: false,
            routing_allowed: true,
            last_seen: BTreeMap::new(),
        }
    }

    /// Number of eras currently retained, including the open one.
    pub fn retained_eras(&self) -> u64 {
        self.oldest_era.distance_to(self.era) as u64 + 1
    }

    /// Whether `era` lies in the retained window.
    pub fn retains(&self, era: Era) -> bool {
        era.is_within(self.oldest_era, self.era)
    }

    /// Where to start sending local content to `peer`.
    ///
    /// Unknown peers, and peers whose checkpoint fell out of the retention
    /// window, start at the oldest retained era.
    pub fn sync_start(&self, peer: &PeerId) -> Era {
        match self.last_seen.get(peer) {
            Some(era) if self.retains(*era) => *era,
            _ => self.oldest_era,
        }
    }
}
