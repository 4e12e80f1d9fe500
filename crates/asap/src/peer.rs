//! The Peer: one local identity with its engines, encounters and sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use asap_core::{ChannelMeta, Crypto, Era, Format, Medium, NoCrypto, PeerId};
use asap_store::{ChunkStore, MemoryChunkStore, MemoryStateStore, SqliteChunkStore, StateStore};
use asap_sync::{
    ChannelAdmission, ChunkReceivedListener, ConnectionListener, EncounterConfig,
    EncounterManager, EngineConfig, EngineHandle, EngineRegistry, LinkInfo, ListenerId,
    ListenerRegistry, OnlinePeersListener, SessionContext, SessionHandle, SyncConfig, SyncEngine,
    SyncError,
};

use crate::error::{PeerError, Result};

/// Configuration for a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Configuration applied to every engine.
    pub engine: EngineConfig,
    /// Session configuration.
    pub sync: SyncConfig,
    /// Encounter admission configuration.
    pub encounter: EncounterConfig,
    /// Directory for one SQLite database per format. In-memory storage when
    /// absent.
    pub data_dir: Option<PathBuf>,
}

/// Live sessions by id.
#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<u64, SessionHandle>>,
}

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, session: &SessionHandle) {
        self.lock().insert(session.id(), session.clone());
    }

    /// Live sessions by id, forgetting the ones that have terminated.
    fn snapshot(&self) -> Vec<SessionHandle> {
        let mut table = self.lock();
        table.retain(|_, session| !session.is_terminated());
        let mut sessions: Vec<SessionHandle> = table.values().cloned().collect();
        sessions.sort_by_key(SessionHandle::id);
        sessions
    }
}

impl ConnectionListener for SessionTable {
    fn session_started(&self, session: &SessionHandle) {
        self.insert(session);
    }

    fn session_terminated(&self, session: &SessionHandle, _reason: &SyncError) {
        self.lock().remove(&session.id());
    }
}

/// A local peer.
///
/// Provides a unified API for:
/// - Registering formats and managing their channels
/// - Appending messages, pushed live to connected peers
/// - Reading local and received messages
/// - Admitting encounters and running their sessions
pub struct Peer {
    id: PeerId,
    config: PeerConfig,
    engines: EngineRegistry,
    admission: Option<Arc<dyn ChannelAdmission>>,
    chunk_listeners: Arc<ListenerRegistry<dyn ChunkReceivedListener>>,
    encounters: Arc<EncounterManager>,
    sessions: Arc<SessionTable>,
    context: SessionContext,
}

impl Peer {
    /// Create a peer that neither signs nor requires signatures.
    pub fn new(id: PeerId, config: PeerConfig) -> Self {
        Self::with_crypto(id, config, Arc::new(NoCrypto))
    }

    /// Create a peer using `crypto` for signing and verification.
    pub fn with_crypto(id: PeerId, config: PeerConfig, crypto: Arc<dyn Crypto>) -> Self {
        let engines = EngineRegistry::new();
        let encounters = Arc::new(EncounterManager::new(id.clone(), config.encounter.clone()));
        let sessions = Arc::new(SessionTable::default());

        let context = SessionContext::new(config.sync.clone(), engines.clone(), crypto);
        context.listeners.register(sessions.clone());
        context.listeners.register(encounters.clone());

        Self {
            id,
            config,
            engines,
            admission: None,
            chunk_listeners: Arc::new(ListenerRegistry::new()),
            encounters,
            sessions,
            context,
        }
    }

    /// Decide channel creation with `admission` for formats added from now on.
    pub fn with_admission(mut self, admission: Arc<dyn ChannelAdmission>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// The encounter manager, for deny lists and aliases.
    pub fn encounters(&self) -> &EncounterManager {
        &self.encounters
    }

    /// Engine of `format`.
    pub fn engine(&self, format: &Format) -> Result<EngineHandle> {
        self.engines
            .get(format)
            .ok_or_else(|| PeerError::UnknownFormat(format.clone()))
    }

    /// Registered formats, sorted.
    pub fn formats(&self) -> Vec<Format> {
        self.engines.formats()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Formats and Channels
    // ─────────────────────────────────────────────────────────────────────────

    /// Open the engine for `format`.
    ///
    /// With a data directory the engine lives in `<hex(format)>.db` there and
    /// picks up its previous state; otherwise it starts empty in memory.
    pub async fn add_format(&self, format: Format) -> Result<EngineHandle> {
        if self.engines.get(&format).is_some() {
            return Err(PeerError::FormatExists(format));
        }

        let (chunks, states): (Arc<dyn ChunkStore>, Arc<dyn StateStore>) = match &self.config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(asap_store::StoreError::from)?;
                let path = dir.join(format!("{}.db", hex::encode(format.as_str())));
                let store = Arc::new(SqliteChunkStore::open(&path)?);
                (store.clone(), store)
            }
            None => (Arc::new(MemoryChunkStore::new()), Arc::new(MemoryStateStore::new())),
        };

        let mut engine = SyncEngine::open(
            self.id.clone(),
            format.clone(),
            self.config.engine.clone(),
            chunks,
            states,
        )
        .await?
        .with_listeners(self.chunk_listeners.clone());
        if let Some(admission) = &self.admission {
            engine = engine.with_admission(admission.clone());
        }

        let handle = engine.into_handle();
        self.engines.insert(format.clone(), handle.clone());
        tracing::info!(peer = %self.id, format = %format, "format added");
        Ok(handle)
    }

    /// Create a local channel, or replace its metadata.
    pub async fn create_channel(&self, format: &Format, uri: &str, meta: ChannelMeta) -> Result<()> {
        let engine = self.engine(format)?;
        let mut engine = engine.lock().await;
        engine.create_channel(uri, meta).await?;
        Ok(())
    }

    /// Append `message` to a local channel.
    ///
    /// Every connected peer the channel admits is sent the open-era chunk so
    /// far, which completes whatever an earlier push left out. A failed push
    /// is logged; the message stays stored and is offered again with its era.
    pub async fn append(&self, format: &Format, uri: &str, message: &[u8]) -> Result<Era> {
        let engine = self.engine(format)?;

        let (era, pushes) = {
            let mut engine = engine.lock().await;
            let era = engine.append(uri, message).await?;

            let mut pushes = Vec::new();
            for session in self.sessions.snapshot() {
                if let Some(chunk) = engine.live_assimilate(uri, session.remote()).await? {
                    pushes.push((session, chunk));
                }
            }
            (era, pushes)
        };

        for (session, (header, messages)) in pushes {
            if let Err(e) = session.send_live(header, messages).await {
                tracing::warn!(peer = %session.remote(), uri, error = %e, "live push failed");
            }
        }
        Ok(era)
    }

    /// Local messages of `uri` across the retained eras, oldest first.
    pub async fn messages(&self, format: &Format, uri: &str) -> Result<Vec<Bytes>> {
        let engine = self.engine(format)?;
        let engine = engine.lock().await;
        let messages = engine.local_messages(uri).collect().await?;
        Ok(messages)
    }

    /// Messages of `uri` received from `sender`, in the sender's era order.
    pub async fn received(&self, format: &Format, sender: &PeerId, uri: &str) -> Result<Vec<Bytes>> {
        let engine = self.engine(format)?;
        let engine = engine.lock().await;
        let messages = engine.received_messages(sender, uri).collect().await?;
        Ok(messages)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Encounters
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether an encounter with `peer` (if known) at `address` should happen.
    pub fn should_connect(&self, peer: Option<&PeerId>, address: &str) -> bool {
        self.encounters.should_connect(peer, address)
    }

    /// Run an encounter over a fresh connection of unknown medium.
    pub async fn handle_encounter<R, W>(
        &self,
        reader: R,
        writer: W,
        address: &str,
        initiator: bool,
    ) -> Result<SessionHandle>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let link = LinkInfo::new(Medium::Unknown).with_address(address);
        self.handle_encounter_over(reader, writer, link, initiator).await
    }

    /// Run an encounter over a fresh connection described by `link`.
    ///
    /// Admits the remote peer, closes the open era of every engine and starts
    /// the session. The peer stays online until the session terminates.
    pub async fn handle_encounter_over<R, W>(
        &self,
        reader: R,
        writer: W,
        link: LinkInfo,
        initiator: bool,
    ) -> Result<SessionHandle>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let address = link.address.clone().unwrap_or_default();
        let admitted = self.encounters.accept(reader, writer, address, initiator).await?;

        for engine in self.engines.all() {
            if let Err(e) = engine.lock().await.advance_era().await {
                self.encounters.unregister(&admitted.remote);
                return Err(e.into());
            }
        }

        let session = self.context.start(admitted.remote, link, admitted.reader, admitted.writer);
        self.sessions.insert(&session);
        Ok(session)
    }

    /// Peers with a live session, sorted.
    pub fn online_peers(&self) -> Vec<PeerId> {
        self.encounters.online_peers()
    }

    /// Live sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.snapshot()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_chunk_listener(&self, listener: Arc<dyn ChunkReceivedListener>) -> ListenerId {
        self.chunk_listeners.register(listener)
    }

    pub fn remove_chunk_listener(&self, id: ListenerId) -> bool {
        self.chunk_listeners.unregister(id)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        self.context.listeners.register(listener)
    }

    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.context.listeners.unregister(id)
    }

    pub fn add_online_listener(&self, listener: Arc<dyn OnlinePeersListener>) -> ListenerId {
        self.encounters.listeners().register(listener)
    }

    pub fn remove_online_listener(&self, id: ListenerId) -> bool {
        self.encounters.listeners().unregister(id)
    }

    /// Kill every session and wait for them to terminate.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.snapshot();
        tracing::info!(peer = %self.id, sessions = sessions.len(), "shutting down");
        for session in &sessions {
            session.kill();
        }
        for session in &sessions {
            session.terminated().await;
        }
    }
}
