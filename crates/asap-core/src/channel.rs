//! Channel metadata.
//!
//! A channel is addressed by (format, uri). The metadata travels with every
//! chunk of the channel and is copied forward on each era transition.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::PeerId;

/// Owner, recipients and free-form metadata of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMeta {
    /// Peer that created the channel, if known.
    pub owner: Option<PeerId>,

    /// Peers the channel is delivered to. Empty means public.
    pub recipients: BTreeSet<PeerId>,

    /// Application-defined key/value pairs.
    pub extra: BTreeMap<String, String>,
}

impl ChannelMeta {
    /// Metadata for a public channel.
    pub fn open() -> Self {
        Self::default()
    }

    /// Metadata for a channel delivered only to `recipients`.
    pub fn closed(recipients: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            recipients: recipients.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: PeerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Add one extra metadata entry.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Whether the channel is public (no declared recipients).
    pub fn is_open(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Whether content of this channel may be handed to `peer`.
    pub fn admits(&self, peer: &PeerId) -> bool {
        self.is_open() || self.recipients.contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[test]
    fn test_open_channel_admits_anyone() {
        let meta = ChannelMeta::open();
        assert!(meta.is_open());
        assert!(meta.admits(&peer("anyone")));
    }

    #[test]
    fn test_closed_channel_admits_recipients_only() {
        let meta = ChannelMeta::closed([peer("carol")]);
        assert!(!meta.is_open());
        assert!(meta.admits(&peer("carol")));
        assert!(!meta.admits(&peer("dave")));
    }
}
