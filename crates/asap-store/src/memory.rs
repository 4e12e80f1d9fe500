//! In-memory implementations of the store traits.
//!
//! These are primarily for testing. They have the same semantics as SQLite
//! but keep everything in memory with no persistence.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;

use asap_core::{ChannelMeta, EngineState, Era, Format, Hop, PeerId};

use crate::error::{Result, StoreError};
use crate::traits::{ChunkInfo, ChunkKey, ChunkStore, Origin, StateStore};

/// In-memory chunk store.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<ChunkKey, StoredChunk>>,
}

#[derive(Default)]
struct StoredChunk {
    meta: ChannelMeta,
    messages: Vec<Bytes>,
    delivered_to: BTreeSet<PeerId>,
    hops: Vec<Hop>,
}

impl StoredChunk {
    fn info(&self, key: &ChunkKey) -> ChunkInfo {
        ChunkInfo {
            key: key.clone(),
            meta: self.meta.clone(),
            message_count: self.messages.len(),
            delivered_to: self.delivered_to.clone(),
            hops: self.hops.clone(),
        }
    }
}

impl MemoryChunkStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ChunkKey, StoredChunk>>> {
        self.chunks
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ChunkKey, StoredChunk>>> {
        self.chunks
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn get_or_create(&self, key: &ChunkKey) -> Result<ChunkInfo> {
        let mut chunks = self.write()?;
        Ok(chunks.entry(key.clone()).or_default().info(key))
    }

    async fn get(&self, key: &ChunkKey) -> Result<Option<ChunkInfo>> {
        let chunks = self.read()?;
        Ok(chunks.get(key).map(|chunk| chunk.info(key)))
    }

    async fn exists(&self, key: &ChunkKey) -> Result<bool> {
        Ok(self.read()?.contains_key(key))
    }

    async fn list(&self, origin: &Origin, era: Era) -> Result<Vec<ChunkInfo>> {
        let chunks = self.read()?;
        let mut infos: Vec<ChunkInfo> = chunks
            .iter()
            .filter(|(key, _)| &key.origin == origin && key.era == era)
            .map(|(key, chunk)| chunk.info(key))
            .collect();
        infos.sort_by(|a, b| a.key.uri.cmp(&b.key.uri));
        Ok(infos)
    }

    async fn eras(&self, origin: &Origin) -> Result<Vec<Era>> {
        let chunks = self.read()?;
        let eras: BTreeSet<u32> = chunks
            .keys()
            .filter(|key| &key.origin == origin)
            .map(|key| key.era.value())
            .collect();
        Ok(eras.into_iter().map(Era).collect())
    }

    async fn origins(&self) -> Result<Vec<PeerId>> {
        let chunks = self.read()?;
        let origins: BTreeSet<PeerId> = chunks
            .keys()
            .filter_map(|key| key.origin.sender().cloned())
            .collect();
        Ok(origins.into_iter().collect())
    }

    async fn channel_known(&self, uri: &str) -> Result<bool> {
        Ok(self.read()?.keys().any(|key| key.uri == uri))
    }

    async fn drop_era(&self, origin: &Origin, era: Era) -> Result<()> {
        self.write()?
            .retain(|key, _| !(&key.origin == origin && key.era == era));
        Ok(())
    }

    async fn remove_channel(&self, origin: &Origin, uri: &str) -> Result<()> {
        self.write()?
            .retain(|key, _| !(&key.origin == origin && key.uri == uri));
        Ok(())
    }

    async fn remove_chunk(&self, key: &ChunkKey) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    async fn append_message(&self, key: &ChunkKey, message: &[u8]) -> Result<()> {
        let mut chunks = self.write()?;
        chunks
            .entry(key.clone())
            .or_default()
            .messages
            .push(Bytes::copy_from_slice(message));
        Ok(())
    }

    async fn messages(&self, key: &ChunkKey) -> Result<Vec<Bytes>> {
        let chunks = self.read()?;
        Ok(chunks
            .get(key)
            .map(|chunk| chunk.messages.clone())
            .unwrap_or_default())
    }

    async fn set_meta(&self, key: &ChunkKey, meta: &ChannelMeta) -> Result<()> {
        self.write()?.entry(key.clone()).or_default().meta = meta.clone();
        Ok(())
    }

    async fn set_hops(&self, key: &ChunkKey, hops: &[Hop]) -> Result<()> {
        self.write()?.entry(key.clone()).or_default().hops = hops.to_vec();
        Ok(())
    }

    async fn mark_delivered(&self, key: &ChunkKey, peer: &PeerId) -> Result<()> {
        if let Some(chunk) = self.write()?.get_mut(key) {
            chunk.delivered_to.insert(peer.clone());
        }
        Ok(())
    }
}

/// In-memory engine-state store.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<Format, EngineState>>,
    saves: RwLock<usize>,
}

impl MemoryStateStore {
    /// Create a new empty state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed saves, for asserting persist-before-return.
    pub fn save_count(&self) -> usize {
        self.saves.read().map(|count| *count).unwrap_or(0)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, format: &Format) -> Result<Option<EngineState>> {
        let states = self
            .states
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        Ok(states.get(format).cloned())
    }

    async fn save(&self, state: &EngineState) -> Result<()> {
        self.states
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?
            .insert(state.format.clone(), state.clone());
        if let Ok(mut saves) = self.saves.write() {
            *saves += 1;
        }
        Ok(())
    }
}
