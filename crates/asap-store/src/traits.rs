//! Store traits: the abstract interface for chunk and engine-state persistence.
//!
//! This trait allows the sync engine to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use asap_core::{ChannelMeta, EngineState, Era, Format, Hop, PeerId};

use crate::cursor::MessageCursor;
use crate::error::Result;

/// Where the content of a chunk came from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Appended by the local peer.
    Local,
    /// Received, with this end-to-end sender.
    Received(PeerId),
}

impl Origin {
    /// The end-to-end sender, if the content was received.
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            Origin::Local => None,
            Origin::Received(peer) => Some(peer),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => f.write_str("local"),
            Origin::Received(peer) => write!(f, "from:{}", peer),
        }
    }
}

/// Address of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub origin: Origin,
    pub uri: String,
    pub era: Era,
}

impl ChunkKey {
    /// Create a chunk key.
    pub fn new(origin: Origin, uri: impl Into<String>, era: Era) -> Self {
        Self {
            origin,
            uri: uri.into(),
            era,
        }
    }
}

/// Everything about a chunk except its message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub key: ChunkKey,
    pub meta: ChannelMeta,
    pub message_count: usize,
    pub delivered_to: BTreeSet<PeerId>,
    pub hops: Vec<Hop>,
}

impl ChunkInfo {
    /// An empty chunk with the given metadata.
    pub fn new(key: ChunkKey, meta: ChannelMeta) -> Self {
        Self {
            key,
            meta,
            message_count: 0,
            delivered_to: BTreeSet::new(),
            hops: Vec::new(),
        }
    }

    /// Whether the chunk holds no messages.
    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }

    /// Whether the chunk was already handed to `peer`.
    pub fn delivered_to(&self, peer: &PeerId) -> bool {
        self.delivered_to.contains(peer)
    }

    /// Whether a closed chunk has reached every declared recipient.
    ///
    /// Open chunks never count as fully delivered.
    pub fn fully_delivered(&self) -> bool {
        !self.meta.is_open() && self.meta.recipients.is_subset(&self.delivered_to)
    }
}

/// The chunk storage of one sync engine.
///
/// All methods are async to support both blocking (SQLite) and in-memory
/// backends. For SQLite, blocking work runs on `spawn_blocking`.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Chunk Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a chunk, creating an empty one with default metadata if missing.
    async fn get_or_create(&self, key: &ChunkKey) -> Result<ChunkInfo>;

    /// Get a chunk if it exists.
    async fn get(&self, key: &ChunkKey) -> Result<Option<ChunkInfo>>;

    /// Check whether a chunk exists.
    async fn exists(&self, key: &ChunkKey) -> Result<bool>;

    /// All chunks of one era of one origin.
    async fn list(&self, origin: &Origin, era: Era) -> Result<Vec<ChunkInfo>>;

    /// Distinct eras holding at least one chunk for `origin`.
    async fn eras(&self, origin: &Origin) -> Result<Vec<Era>>;

    /// Every end-to-end sender with received chunks.
    async fn origins(&self) -> Result<Vec<PeerId>>;

    /// Whether any chunk of any origin uses `uri`.
    async fn channel_known(&self, uri: &str) -> Result<bool>;

    /// Irreversibly remove every chunk of `era` for `origin`.
    async fn drop_era(&self, origin: &Origin, era: Era) -> Result<()>;

    /// Remove every chunk of a channel for `origin`.
    async fn remove_channel(&self, origin: &Origin, uri: &str) -> Result<()>;

    /// Remove one chunk.
    async fn remove_chunk(&self, key: &ChunkKey) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Content Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Append one message, creating the chunk if needed.
    async fn append_message(&self, key: &ChunkKey, message: &[u8]) -> Result<()>;

    /// Messages of a chunk in append order. Missing chunks yield nothing.
    async fn messages(&self, key: &ChunkKey) -> Result<Vec<Bytes>>;

    /// Replace the channel metadata stored with a chunk, creating it if needed.
    async fn set_meta(&self, key: &ChunkKey, meta: &ChannelMeta) -> Result<()>;

    /// Replace the hop list stored with a chunk, creating it if needed.
    async fn set_hops(&self, key: &ChunkKey, hops: &[Hop]) -> Result<()>;

    /// Record that a chunk was handed to `peer`. Idempotent.
    async fn mark_delivered(&self, key: &ChunkKey, peer: &PeerId) -> Result<()>;
}

/// Extension trait for common store patterns.
pub trait ChunkStoreExt: ChunkStore {
    /// Messages of `uri` for `origin` across `from..=to`, one chunk at a time.
    ///
    /// The range wraps when `from > to`.
    fn messages_for(&self, origin: &Origin, uri: &str, from: Era, to: Era) -> MessageCursor<'_, Self> {
        MessageCursor::new(self, origin.clone(), uri.to_string(), from, to)
    }
}

impl<S: ChunkStore + ?Sized> ChunkStoreExt for S {}

/// Persistence of engine state.
///
/// `save` must be crash-consistent: after it returns, a restart observes
/// either the old or the new state in full, and the new state once `save`
/// has completed.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the saved state of `format`, if any.
    async fn load(&self, format: &Format) -> Result<Option<EngineState>>;

    /// Persist `state`, replacing the previous snapshot for its format.
    async fn save(&self, state: &EngineState) -> Result<()>;
}
