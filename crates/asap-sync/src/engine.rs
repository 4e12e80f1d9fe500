//! The sync engine: one per (local peer, format).
//!
//! The engine answers INTEREST with the chunks the remote peer has not seen
//! yet, stores incoming ASSIMILATE chunks, and moves the era forward. All
//! era bookkeeping lives in [`EngineState`], which is saved through the
//! [`StateStore`] before the in-memory copy changes.
//!
//! Engines are not reentrant. Sessions reach them through an
//! [`EngineHandle`] and hold its lock while storing one ASSIMILATE. An
//! INTEREST is answered in three steps: [`SyncEngine::prepare_interest`]
//! under the lock, [`InterestReply::send`] without it, and
//! [`SyncEngine::complete_interest`] under the lock again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use asap_core::{ChannelMeta, EngineState, Era, Format, Hop, Medium, PeerId};
use asap_store::{ChunkInfo, ChunkKey, ChunkStore, ChunkStoreExt, MessageCursor, Origin, StateStore};

use crate::codec::{Payload, PduSink};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::listener::ListenerRegistry;
use crate::pdu::{AssimilateHeader, Framing, Interest, Pdu};

/// Shared, lockable engine.
pub type EngineHandle = Arc<tokio::sync::Mutex<SyncEngine>>;

/// What the session knows about the link a PDU arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveContext {
    /// The immediate sender.
    pub remote: PeerId,
    pub medium: Medium,
    /// The PDU carried a signature the crypto collaborator accepted.
    pub verified: bool,
    /// The link is encrypted.
    pub encrypted: bool,
}

/// Decides whether a channel first seen on the wire may be created locally.
#[async_trait]
pub trait ChannelAdmission: Send + Sync {
    async fn allowed_to_create_channel(&self, format: &Format, uri: &str, sender: &PeerId) -> bool;
}

/// Admits every channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitAll;

#[async_trait]
impl ChannelAdmission for AdmitAll {
    async fn allowed_to_create_channel(&self, _format: &Format, _uri: &str, _sender: &PeerId) -> bool {
        true
    }
}

/// A chunk that was stored from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceived {
    pub format: Format,
    /// End-to-end sender.
    pub sender: PeerId,
    pub uri: String,
    pub era: Era,
    /// Hops including the one appended on receipt.
    pub hops: Vec<Hop>,
    /// Messages stored by this delivery.
    pub message_count: usize,
}

/// Observer of stored chunks.
pub trait ChunkReceivedListener: Send + Sync {
    fn chunk_received(&self, event: &ChunkReceived);
}

/// Engines by format, shared between the host and its sessions.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: Arc<RwLock<BTreeMap<Format, EngineHandle>>>,
}

impl EngineRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine, replacing any engine of the same format.
    pub fn insert(&self, format: Format, engine: EngineHandle) {
        self.engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(format, engine);
    }

    /// The engine serving `format`.
    pub fn get(&self, format: &Format) -> Option<EngineHandle> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(format)
            .cloned()
    }

    /// Every engine, ordered by format.
    pub fn all(&self) -> Vec<EngineHandle> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Registered formats.
    pub fn formats(&self) -> Vec<Format> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Sync engine for one format.
pub struct SyncEngine {
    config: EngineConfig,
    state: EngineState,
    chunks: Arc<dyn ChunkStore>,
    states: Arc<dyn StateStore>,
    admission: Arc<dyn ChannelAdmission>,
    listeners: Arc<ListenerRegistry<dyn ChunkReceivedListener>>,
    /// Last `last_seen` map each peer reported in its INTEREST.
    reported: HashMap<PeerId, BTreeMap<PeerId, Era>>,
}

impl SyncEngine {
    /// Open the engine of `owner` for `format`, restoring saved state.
    pub async fn open(
        owner: PeerId,
        format: Format,
        config: EngineConfig,
        chunks: Arc<dyn ChunkStore>,
        states: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let restored = states.load(&format).await?;
        let fresh = restored.is_none();
        let mut state = restored.unwrap_or_else(|| EngineState::new(owner.clone(), format.clone()));

        if state.owner != owner {
            tracing::warn!(
                format = %format,
                saved = %state.owner,
                owner = %owner,
                "saved engine state belongs to another peer, taking it over"
            );
            state.owner = owner;
        }

        let routing_changed = state.routing_allowed != config.routing_allowed;
        state.routing_allowed = config.routing_allowed;
        if fresh || routing_changed {
            states.save(&state).await?;
        }

        tracing::debug!(
            format = %state.format,
            era = %state.era,
            oldest = %state.oldest_era,
            restored = !fresh,
            "opened sync engine"
        );

        Ok(Self {
            config,
            state,
            chunks,
            states,
            admission: Arc::new(AdmitAll),
            listeners: Arc::new(ListenerRegistry::new()),
            reported: HashMap::new(),
        })
    }

    /// Use `admission` for channels first seen on the wire.
    pub fn with_admission(mut self, admission: Arc<dyn ChannelAdmission>) -> Self {
        self.admission = admission;
        self
    }

    /// Notify the listeners in `listeners` about stored chunks.
    pub fn with_listeners(mut self, listeners: Arc<ListenerRegistry<dyn ChunkReceivedListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Wrap the engine for sharing with sessions.
    pub fn into_handle(self) -> EngineHandle {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn format(&self) -> &Format {
        &self.state.format
    }

    pub fn owner(&self) -> &PeerId {
        &self.state.owner
    }

    /// The open era.
    pub fn era(&self) -> Era {
        self.state.era
    }

    /// Snapshot of the engine state.
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn chunks(&self) -> &Arc<dyn ChunkStore> {
        &self.chunks
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry<dyn ChunkReceivedListener>> {
        &self.listeners
    }

    /// The `last_seen` map `peer` sent with its latest INTEREST.
    pub fn reported_encounters(&self, peer: &PeerId) -> Option<&BTreeMap<PeerId, Era>> {
        self.reported.get(peer)
    }

    /// Save `next`, then make it the current state.
    ///
    /// A failed save is logged and the in-memory state still moves on.
    async fn commit(&mut self, next: EngineState) {
        if let Err(e) = self.states.save(&next).await {
            tracing::warn!(format = %next.format, error = %e, "failed to persist engine state");
        }
        self.state = next;
    }

    fn local_key(&self, uri: &str, era: Era) -> ChunkKey {
        ChunkKey::new(Origin::Local, uri, era)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a channel in the open era, or replace its metadata.
    ///
    /// A channel without owner is owned by the local peer.
    pub async fn create_channel(&mut self, uri: &str, meta: ChannelMeta) -> Result<()> {
        let meta = match meta.owner {
            Some(_) => meta,
            None => meta.with_owner(self.state.owner.clone()),
        };
        self.chunks.set_meta(&self.local_key(uri, self.state.era), &meta).await?;
        tracing::debug!(format = %self.state.format, uri, open = meta.is_open(), "created channel");
        Ok(())
    }

    /// Append a message to a local channel in the open era.
    ///
    /// Returns the era the message landed in.
    pub async fn append(&mut self, uri: &str, message: &[u8]) -> Result<Era> {
        if message.is_empty() {
            return Err(SyncError::InvalidMessage("empty messages cannot be framed".into()));
        }

        let key = self.local_key(uri, self.state.era);
        if !self.chunks.exists(&key).await? {
            let meta = ChannelMeta::open().with_owner(self.state.owner.clone());
            self.chunks.set_meta(&key, &meta).await?;
        }

        if !self.state.content_changed {
            let mut next = self.state.clone();
            next.content_changed = true;
            self.commit(next).await;
        }

        self.chunks.append_message(&key, message).await?;
        Ok(self.state.era)
    }

    /// Remove a local channel from every retained era.
    pub async fn remove_channel(&mut self, uri: &str) -> Result<()> {
        self.chunks.remove_channel(&Origin::Local, uri).await?;
        Ok(())
    }

    /// Metadata of a local channel as of the open era.
    pub async fn channel_meta(&self, uri: &str) -> Result<Option<ChannelMeta>> {
        let chunk = self.chunks.get(&self.local_key(uri, self.state.era)).await?;
        Ok(chunk.map(|chunk| chunk.meta))
    }

    /// URIs of the local channels in the open era.
    pub async fn channels(&self) -> Result<Vec<String>> {
        let chunks = self.chunks.list(&Origin::Local, self.state.era).await?;
        Ok(chunks.into_iter().map(|chunk| chunk.key.uri).collect())
    }

    /// Local messages of `uri` across the retained window, oldest era first.
    pub fn local_messages(&self, uri: &str) -> MessageCursor<'_, dyn ChunkStore> {
        self.chunks
            .as_ref()
            .messages_for(&Origin::Local, uri, self.state.oldest_era, self.state.era)
    }

    /// Messages of `uri` received from `sender`, in the sender's era order.
    pub fn received_messages(&self, sender: &PeerId, uri: &str) -> MessageCursor<'_, dyn ChunkStore> {
        self.chunks
            .as_ref()
            .messages_for(&Origin::Received(sender.clone()), uri, Era::MIN, Era::MAX)
    }

    /// The INTEREST this engine sends to `recipient` when a session starts.
    pub fn interest(&self, recipient: &PeerId) -> Interest {
        Interest {
            format: self.state.format.clone(),
            sender: Some(self.state.owner.clone()),
            recipient: Some(recipient.clone()),
            channel: None,
            era_from: Some(self.state.oldest_era),
            era_to: Some(self.state.era),
            routing: self.state.routing_allowed,
            encounters: if self.state.last_seen.is_empty() {
                None
            } else {
                Some(self.state.last_seen.clone())
            },
        }
    }

    /// The open-era chunk of `uri` as pushed to `recipient` while a session
    /// is up: the header and every message appended so far.
    ///
    /// Receivers keep the messages they already hold and append the rest, so
    /// each push supersedes the previous one. `None` when the channel is
    /// empty or excludes the recipient.
    pub async fn live_assimilate(&self, uri: &str, recipient: &PeerId) -> Result<Option<(AssimilateHeader, Vec<Bytes>)>> {
        let key = self.local_key(uri, self.state.era);
        let Some(chunk) = self.chunks.get(&key).await? else {
            return Ok(None);
        };
        if !offerable(&chunk, recipient) {
            return Ok(None);
        }

        let messages = self.chunks.messages(&key).await?;
        let mut header = AssimilateHeader::new(self.state.format.clone(), uri, self.state.era);
        header.sender = Some(self.state.owner.clone());
        header.recipient = (!chunk.meta.is_open()).then(|| recipient.clone());
        header.framing = Framing::of(&messages);
        Ok(Some((header, messages)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Protocol
    // ─────────────────────────────────────────────────────────────────────────

    /// Answer an INTEREST from `ctx.remote`, writing ASSIMILATE PDUs to `sink`.
    ///
    /// Returns the number of chunks sent.
    pub async fn handle_interest(
        &mut self,
        interest: &Interest,
        ctx: &ReceiveContext,
        sink: &dyn PduSink,
    ) -> Result<usize> {
        let reply = self.prepare_interest(interest, ctx).await?;
        let sent = reply.send(sink).await?;
        self.complete_interest(&reply).await;
        Ok(sent)
    }

    /// Pick the chunks that answer an INTEREST from `ctx.remote`.
    ///
    /// The returned reply is sent without the engine, then handed back to
    /// [`SyncEngine::complete_interest`].
    pub async fn prepare_interest(&mut self, interest: &Interest, ctx: &ReceiveContext) -> Result<InterestReply> {
        let peer = &ctx.remote;
        if let Some(sender) = &interest.sender {
            if sender != peer {
                tracing::debug!(remote = %peer, claimed = %sender, "INTEREST sender differs from remote");
            }
        }

        let current = self.state.era;
        let start = self.state.sync_start(peer);
        let mut offers = Vec::new();

        if start != current {
            let end = current.previous();
            let mut eras: Vec<Era> = self
                .chunks
                .eras(&Origin::Local)
                .await?
                .into_iter()
                .filter(|era| era.is_within(start, end))
                .collect();
            Era::sort_from(start, &mut eras);

            for era in eras {
                for chunk in self.chunks.list(&Origin::Local, era).await? {
                    if offerable(&chunk, peer) {
                        offers.push(chunk.key);
                    }
                }
            }
        }

        if self.state.routing_allowed && interest.routing {
            self.collect_routed(peer, &mut offers).await?;
        }

        if let Some(encounters) = &interest.encounters {
            self.reported.insert(peer.clone(), encounters.clone());
        }

        Ok(InterestReply {
            peer: peer.clone(),
            from: start,
            era: current,
            format: self.state.format.clone(),
            owner: self.state.owner.clone(),
            drop_delivered: self.config.drop_delivered,
            chunks: self.chunks.clone(),
            offers,
        })
    }

    /// Record that `reply` reached its peer: its `last_seen` becomes the era
    /// the reply was prepared in.
    pub async fn complete_interest(&mut self, reply: &InterestReply) {
        let mut next = self.state.clone();
        next.last_seen.insert(reply.peer.clone(), reply.era);
        self.commit(next).await;

        tracing::debug!(
            format = %self.state.format,
            peer = %reply.peer,
            from = %reply.from,
            era = %reply.era,
            chunks = reply.offers.len(),
            "answered INTEREST"
        );
    }

    /// Chunks received from third parties that `peer` has not been handed.
    async fn collect_routed(&self, peer: &PeerId, offers: &mut Vec<ChunkKey>) -> Result<()> {
        for origin in self.chunks.origins().await? {
            if &origin == peer || origin == self.state.owner {
                continue;
            }

            let start = self
                .state
                .last_seen
                .get(&origin)
                .copied()
                .unwrap_or(self.state.oldest_era);
            let origin = Origin::Received(origin);
            let mut eras = self.chunks.eras(&origin).await?;
            Era::sort_from(start, &mut eras);

            for era in eras {
                for chunk in self.chunks.list(&origin, era).await? {
                    if !chunk.delivered_to(peer) && offerable(&chunk, peer) {
                        offers.push(chunk.key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Store an incoming chunk, reading its messages from `payload`.
    ///
    /// Returns whether anything was stored. Self-originated chunks are
    /// skipped. A chunk that is already stored only gains the messages past
    /// the ones it holds, so repeated deliveries are no-ops and a chunk that
    /// kept growing in its sender's open era is completed. The caller drains
    /// whatever is left.
    pub async fn handle_assimilate(
        &mut self,
        header: &AssimilateHeader,
        payload: &mut Payload<'_>,
        ctx: &ReceiveContext,
    ) -> Result<bool> {
        let sender = header.sender.clone().unwrap_or_else(|| ctx.remote.clone());
        if sender == self.state.owner {
            tracing::debug!(uri = %header.channel, era = %header.era, "ignoring own chunk");
            return Ok(false);
        }

        let key = ChunkKey::new(Origin::Received(sender.clone()), header.channel.clone(), header.era);
        if let Some(stored) = self.chunks.get(&key).await? {
            return self.extend_chunk(header, sender, stored, payload).await;
        }

        if !self.chunks.channel_known(&header.channel).await?
            && !self
                .admission
                .allowed_to_create_channel(&self.state.format, &header.channel, &sender)
                .await
        {
            return Err(SyncError::AdmissionDenied(header.channel.clone()));
        }

        let meta = match &header.recipient {
            Some(recipient) => ChannelMeta::closed([recipient.clone()]),
            None => ChannelMeta::open(),
        }
        .with_owner(sender.clone());

        let mut hops = header.hops.clone();
        hops.push(Hop::new(ctx.remote.clone(), ctx.medium, ctx.verified, ctx.encrypted));

        let lengths = header.framing.message_lengths();
        if let Err(e) = self.store_chunk(&key, &meta, &hops, &lengths, payload).await {
            if let Err(cleanup) = self.chunks.remove_chunk(&key).await {
                tracing::warn!(error = %cleanup, "failed to remove partial chunk");
            }
            return Err(e);
        }

        let event = ChunkReceived {
            format: self.state.format.clone(),
            sender,
            uri: header.channel.clone(),
            era: header.era,
            hops,
            message_count: lengths.len(),
        };
        tracing::debug!(
            format = %event.format,
            sender = %event.sender,
            uri = %event.uri,
            era = %event.era,
            messages = event.message_count,
            "stored chunk"
        );
        for listener in self.listeners.snapshot() {
            listener.chunk_received(&event);
        }
        Ok(true)
    }

    /// Append the messages of `header` that `stored` does not hold yet.
    async fn extend_chunk(
        &mut self,
        header: &AssimilateHeader,
        sender: PeerId,
        stored: ChunkInfo,
        payload: &mut Payload<'_>,
    ) -> Result<bool> {
        let lengths = header.framing.message_lengths();
        let held = stored.message_count;
        if lengths.len() <= held {
            tracing::debug!(
                uri = %header.channel,
                era = %header.era,
                messages = lengths.len(),
                "chunk already stored"
            );
            return Ok(false);
        }

        payload.skip(lengths[..held].iter().sum()).await?;
        for &len in &lengths[held..] {
            let message = payload.read_message(len).await?;
            self.chunks.append_message(&stored.key, &message).await?;
        }

        let event = ChunkReceived {
            format: self.state.format.clone(),
            sender,
            uri: header.channel.clone(),
            era: header.era,
            hops: stored.hops,
            message_count: lengths.len() - held,
        };
        tracing::debug!(
            sender = %event.sender,
            uri = %event.uri,
            era = %event.era,
            messages = event.message_count,
            "extended chunk"
        );
        for listener in self.listeners.snapshot() {
            listener.chunk_received(&event);
        }
        Ok(true)
    }

    async fn store_chunk(
        &self,
        key: &ChunkKey,
        meta: &ChannelMeta,
        hops: &[Hop],
        lengths: &[u64],
        payload: &mut Payload<'_>,
    ) -> Result<()> {
        self.chunks.set_meta(key, meta).await?;
        for &len in lengths {
            let message = payload.read_message(len).await?;
            self.chunks.append_message(key, &message).await?;
        }
        self.chunks.set_hops(key, hops).await?;
        Ok(())
    }

    /// Close the open era if anything was appended to it.
    ///
    /// Returns whether the era moved.
    pub async fn advance_era(&mut self) -> Result<bool> {
        if !self.state.content_changed {
            return Ok(false);
        }

        let closed = self.state.era;
        let mut next = self.state.clone();
        next.era = closed.next();
        next.content_changed = false;

        let mut pruned = Vec::new();
        while next.retained_eras() > self.config.retained_eras() {
            pruned.push(next.oldest_era);
            next.oldest_era = next.oldest_era.next();
        }

        self.commit(next).await;

        for era in pruned {
            self.chunks.drop_era(&Origin::Local, era).await?;
            tracing::debug!(format = %self.state.format, era = %era, "pruned era");
        }

        for chunk in self.chunks.list(&Origin::Local, closed).await? {
            let key = self.local_key(&chunk.key.uri, self.state.era);
            self.chunks.set_meta(&key, &chunk.meta).await?;
        }

        tracing::info!(format = %self.state.format, era = %self.state.era, "advanced era");
        Ok(true)
    }
}

fn offerable(chunk: &ChunkInfo, peer: &PeerId) -> bool {
    !chunk.is_empty() && chunk.meta.admits(peer)
}

/// The chunks answering one INTEREST.
///
/// Holds its own reference to the chunk store so it can be sent while the
/// engine is free to serve other sessions.
pub struct InterestReply {
    peer: PeerId,
    from: Era,
    era: Era,
    format: Format,
    owner: PeerId,
    drop_delivered: bool,
    chunks: Arc<dyn ChunkStore>,
    offers: Vec<ChunkKey>,
}

impl InterestReply {
    /// The peer the reply goes to.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Number of chunks picked.
    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// Write every picked chunk to `sink`, marking each delivered once sent.
    ///
    /// Chunks dropped since the reply was prepared are skipped; chunks that
    /// grew are sent as they are now. Returns the number of chunks sent.
    pub async fn send(&self, sink: &dyn PduSink) -> Result<usize> {
        let mut sent = 0;
        for key in &self.offers {
            let Some(chunk) = self.chunks.get(key).await? else {
                continue;
            };
            if !offerable(&chunk, &self.peer) {
                continue;
            }
            self.offer(&chunk, sink).await?;
            sent += 1;
        }
        Ok(sent)
    }

    async fn offer(&self, chunk: &ChunkInfo, sink: &dyn PduSink) -> Result<()> {
        let messages = self.chunks.messages(&chunk.key).await?;
        let sender = match &chunk.key.origin {
            Origin::Local => self.owner.clone(),
            Origin::Received(sender) => sender.clone(),
        };

        let mut header = AssimilateHeader::new(self.format.clone(), chunk.key.uri.clone(), chunk.key.era);
        header.sender = Some(sender);
        header.recipient = (!chunk.meta.is_open()).then(|| self.peer.clone());
        header.routed = chunk.key.origin != Origin::Local;
        header.hops = chunk.hops.clone();
        header.framing = Framing::of(&messages);

        sink.send(&Pdu::Assimilate(header), &messages).await?;
        self.chunks.mark_delivered(&chunk.key, &self.peer).await?;

        if self.drop_delivered {
            if let Some(updated) = self.chunks.get(&chunk.key).await? {
                if updated.fully_delivered() {
                    self.chunks.remove_chunk(&chunk.key).await?;
                    tracing::debug!(uri = %chunk.key.uri, era = %chunk.key.era, "dropped fully delivered chunk");
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for InterestReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterestReply")
            .field("peer", &self.peer)
            .field("era", &self.era)
            .field("offers", &self.offers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asap_store::{MemoryChunkStore, MemoryStateStore};
    use std::sync::Mutex;

    struct RecordingSink {
        sent: Mutex<Vec<(Pdu, Vec<Bytes>)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }

        fn headers(&self) -> Vec<AssimilateHeader> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(pdu, _)| match pdu {
                    Pdu::Assimilate(header) => Some(header.clone()),
                    _ => None,
                })
                .collect()
        }

        fn take(&self) -> Vec<(Pdu, Vec<Bytes>)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl PduSink for RecordingSink {
        async fn send(&self, pdu: &Pdu, payload: &[Bytes]) -> Result<()> {
            self.sent.lock().unwrap().push((pdu.clone(), payload.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<ChunkReceived>>);

    impl ChunkReceivedListener for Events {
        fn chunk_received(&self, event: &ChunkReceived) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    struct DenyAll;

    #[async_trait]
    impl ChannelAdmission for DenyAll {
        async fn allowed_to_create_channel(&self, _: &Format, _: &str, _: &PeerId) -> bool {
            false
        }
    }

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    fn ctx(remote: &str) -> ReceiveContext {
        ReceiveContext {
            remote: peer(remote),
            medium: Medium::AdHoc,
            verified: false,
            encrypted: false,
        }
    }

    fn interest_from(engine: &SyncEngine, remote: &str) -> Interest {
        let mut interest = Interest::new(engine.format().clone());
        interest.sender = Some(peer(remote));
        interest.routing = true;
        interest
    }

    async fn engine_with(owner: &str, config: EngineConfig) -> (SyncEngine, Arc<MemoryStateStore>) {
        let states = Arc::new(MemoryStateStore::new());
        let engine = SyncEngine::open(
            peer(owner),
            Format::new("chat").unwrap(),
            config,
            Arc::new(MemoryChunkStore::new()),
            states.clone(),
        )
        .await
        .unwrap();
        (engine, states)
    }

    async fn engine(owner: &str) -> SyncEngine {
        engine_with(owner, EngineConfig::default()).await.0
    }

    /// Feed what `sink` recorded into `engine` as if it came from `remote`.
    async fn deliver(engine: &mut SyncEngine, sink: &RecordingSink, remote: &str) -> usize {
        let mut stored = 0;
        for (pdu, payload) in sink.take() {
            let Pdu::Assimilate(header) = pdu else { continue };
            let bytes: Vec<u8> = payload.iter().flat_map(|part| part.iter().copied()).collect();
            let mut reader: &[u8] = &bytes;
            let mut payload = Payload::new(&mut reader, header.framing.payload_len);
            if engine.handle_assimilate(&header, &mut payload, &ctx(remote)).await.unwrap() {
                stored += 1;
            }
            payload.drain().await.unwrap();
        }
        stored
    }

    #[tokio::test]
    async fn test_open_era_is_never_sent() {
        let mut alice = engine("alice").await;
        alice.append("sn://chat", b"draft").await.unwrap();

        let sink = RecordingSink::new();
        let sent = alice.handle_interest(&interest_from(&alice, "bob"), &ctx("bob"), &sink).await.unwrap();
        assert_eq!(sent, 0);
        assert_eq!(alice.state().last_seen.get(&peer("bob")), Some(&Era(0)));
    }

    #[tokio::test]
    async fn test_closed_era_sent_once() {
        let mut alice = engine("alice").await;
        alice.append("sn://chat", b"hello").await.unwrap();
        alice.append("sn://chat", b"world").await.unwrap();
        assert!(alice.advance_era().await.unwrap());

        let sink = RecordingSink::new();
        let interest = interest_from(&alice, "bob");
        assert_eq!(alice.handle_interest(&interest, &ctx("bob"), &sink).await.unwrap(), 1);
        let headers = sink.headers();
        assert_eq!(headers[0].sender, Some(peer("alice")));
        assert_eq!(headers[0].era, Era(0));
        assert!(headers[0].recipient.is_none());
        assert_eq!(headers[0].framing.message_lengths(), vec![5, 5]);

        let again = RecordingSink::new();
        assert_eq!(alice.handle_interest(&interest, &ctx("bob"), &again).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_chunk_gets_one_hop() {
        let mut alice = engine("alice").await;
        let mut bob = engine("bob").await;
        alice.append("sn://chat", b"hi bob").await.unwrap();
        alice.advance_era().await.unwrap();

        let sink = RecordingSink::new();
        alice.handle_interest(&interest_from(&alice, "bob"), &ctx("bob"), &sink).await.unwrap();
        assert_eq!(deliver(&mut bob, &sink, "alice").await, 1);

        let key = ChunkKey::new(Origin::Received(peer("alice")), "sn://chat", Era(0));
        let chunk = bob.chunks().get(&key).await.unwrap().unwrap();
        assert_eq!(chunk.hops, vec![Hop::new(peer("alice"), Medium::AdHoc, false, false)]);
        let messages = bob.received_messages(&peer("alice"), "sn://chat").collect().await.unwrap();
        assert_eq!(messages, vec![Bytes::from("hi bob")]);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let mut alice = engine("alice").await;
        let mut bob = engine("bob").await;
        alice.append("sn://chat", b"once").await.unwrap();
        alice.advance_era().await.unwrap();

        let first = RecordingSink::new();
        alice.handle_interest(&interest_from(&alice, "bob"), &ctx("bob"), &first).await.unwrap();
        let replay = RecordingSink::new();
        for (pdu, payload) in first.sent.lock().unwrap().iter() {
            replay.sent.lock().unwrap().push((pdu.clone(), payload.clone()));
        }

        assert_eq!(deliver(&mut bob, &first, "alice").await, 1);
        assert_eq!(deliver(&mut bob, &replay, "alice").await, 0);
        let messages = bob.received_messages(&peer("alice"), "sn://chat").collect().await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_own_chunks_are_not_stored() {
        let mut alice = engine("alice").await;
        let mut header = AssimilateHeader::new(alice.format().clone(), "sn://chat", Era(0));
        header.sender = Some(peer("alice"));
        header.framing = Framing::of(&[Bytes::from("echo")]);

        let data = b"echo".to_vec();
        let mut reader: &[u8] = &data;
        let mut payload = Payload::new(&mut reader, 4);
        assert!(!alice.handle_assimilate(&header, &mut payload, &ctx("bob")).await.unwrap());
        assert_eq!(payload.remaining(), 4);
        assert!(alice.chunks().origins().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel_filtering() {
        let mut alice = engine("alice").await;
        alice
            .create_channel("sn://secret", ChannelMeta::closed([peer("carol")]))
            .await
            .unwrap();
        alice.append("sn://secret", b"for carol").await.unwrap();
        alice.advance_era().await.unwrap();

        let to_bob = RecordingSink::new();
        assert_eq!(alice.handle_interest(&interest_from(&alice, "bob"), &ctx("bob"), &to_bob).await.unwrap(), 0);

        let to_carol = RecordingSink::new();
        assert_eq!(alice.handle_interest(&interest_from(&alice, "carol"), &ctx("carol"), &to_carol).await.unwrap(), 1);
        assert_eq!(to_carol.headers()[0].recipient, Some(peer("carol")));
    }

    #[tokio::test]
    async fn test_delivery_is_monotonic() {
        let mut alice = engine("alice").await;
        alice.append("sn://chat", b"m").await.unwrap();
        alice.advance_era().await.unwrap();

        let sink = RecordingSink::new();
        alice.handle_interest(&interest_from(&alice, "bob"), &ctx("bob"), &sink).await.unwrap();
        let key = ChunkKey::new(Origin::Local, "sn://chat", Era(0));
        assert!(alice.chunks().get(&key).await.unwrap().unwrap().delivered_to(&peer("bob")));

        alice.append("sn://chat", b"more").await.unwrap();
        alice.advance_era().await.unwrap();
        alice.handle_interest(&interest_from(&alice, "carol"), &ctx("carol"), &sink).await.unwrap();
        assert!(alice.chunks().get(&key).await.unwrap().unwrap().delivered_to(&peer("bob")));
    }

    #[tokio::test]
    async fn test_routing_forwards_third_party_chunks() {
        let mut alice = engine("alice").await;
        let mut bob = engine("bob").await;
        let mut carol = engine("carol").await;
        alice.append("sn://chat", b"via bob").await.unwrap();
        alice.advance_era().await.unwrap();

        let sink = RecordingSink::new();
        alice.handle_interest(&interest_from(&alice, "bob"), &ctx("bob"), &sink).await.unwrap();
        deliver(&mut bob, &sink, "alice").await;

        let to_carol = RecordingSink::new();
        assert_eq!(bob.handle_interest(&interest_from(&bob, "carol"), &ctx("carol"), &to_carol).await.unwrap(), 1);
        assert!(to_carol.headers()[0].routed);
        deliver(&mut carol, &to_carol, "bob").await;

        let key = ChunkKey::new(Origin::Received(peer("alice")), "sn://chat", Era(0));
        let chunk = carol.chunks().get(&key).await.unwrap().unwrap();
        let senders: Vec<&str> = chunk.hops.iter().map(|hop| hop.sender.as_str()).collect();
        assert_eq!(senders, vec!["alice", "bob"]);

        // Never echoed back to the origin.
        let to_alice = RecordingSink::new();
        assert_eq!(bob.handle_interest(&interest_from(&bob, "alice"), &ctx("alice"), &to_alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_routing_disabled_by_interest() {
        let mut bob = engine("bob").await;
        let mut header = AssimilateHeader::new(bob.format().clone(), "sn://chat", Era(4));
        header.sender = Some(peer("alice"));
        header.framing = Framing::of(&[Bytes::from("x")]);
        let data = b"x".to_vec();
        let mut reader: &[u8] = &data;
        let mut payload = Payload::new(&mut reader, 1);
        bob.handle_assimilate(&header, &mut payload, &ctx("alice")).await.unwrap();

        let mut interest = interest_from(&bob, "carol");
        interest.routing = false;
        let sink = RecordingSink::new();
        assert_eq!(bob.handle_interest(&interest, &ctx("carol"), &sink).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_channel_needs_admission() {
        let mut bob = engine("bob").await.with_admission(Arc::new(DenyAll));
        let mut header = AssimilateHeader::new(bob.format().clone(), "sn://new", Era(0));
        header.sender = Some(peer("alice"));
        header.framing = Framing::of(&[Bytes::from("x")]);
        let data = b"x".to_vec();
        let mut reader: &[u8] = &data;
        let mut payload = Payload::new(&mut reader, 1);

        let err = bob.handle_assimilate(&header, &mut payload, &ctx("alice")).await.unwrap_err();
        assert!(matches!(err, SyncError::AdmissionDenied(_)));
        assert!(!err.is_fatal());
        assert!(!bob.chunks().channel_known("sn://new").await.unwrap());
    }

    #[tokio::test]
    async fn test_advance_without_content_is_noop() {
        let (mut alice, states) = engine_with("alice", EngineConfig::default()).await;
        let saves = states.save_count();
        assert!(!alice.advance_era().await.unwrap());
        assert_eq!(alice.era(), Era(0));
        assert_eq!(states.save_count(), saves);
    }

    #[tokio::test]
    async fn test_advance_persists_and_copies_metadata() {
        let (mut alice, states) = engine_with("alice", EngineConfig::default()).await;
        alice
            .create_channel("sn://team", ChannelMeta::closed([peer("bob")]).with_extra("topic", "ops"))
            .await
            .unwrap();
        alice.append("sn://team", b"standup").await.unwrap();
        alice.advance_era().await.unwrap();

        let saved = states.load(alice.format()).await.unwrap().unwrap();
        assert_eq!(saved.era, Era(1));
        assert!(!saved.content_changed);

        let meta = alice.channel_meta("sn://team").await.unwrap().unwrap();
        assert_eq!(meta.extra.get("topic").map(String::as_str), Some("ops"));
        assert_eq!(meta.owner, Some(peer("alice")));
        let current = ChunkKey::new(Origin::Local, "sn://team", Era(1));
        assert!(alice.chunks().get(&current).await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retention_window_prunes_oldest() {
        let config = EngineConfig { max_eras: 3, ..EngineConfig::default() };
        let (mut alice, _) = engine_with("alice", config).await;
        for round in 0..4u8 {
            alice.append("sn://chat", &[b'a' + round]).await.unwrap();
            alice.advance_era().await.unwrap();
        }

        assert_eq!(alice.era(), Era(4));
        assert_eq!(alice.state().oldest_era, Era(2));
        let eras = alice.chunks().eras(&Origin::Local).await.unwrap();
        assert_eq!(eras, vec![Era(2), Era(3), Era(4)]);
        let messages = alice.local_messages("sn://chat").collect().await.unwrap();
        assert_eq!(messages, vec![Bytes::from("c"), Bytes::from("d")]);
    }

    #[tokio::test]
    async fn test_drop_delivered_removes_closed_chunks() {
        let config = EngineConfig { drop_delivered: true, ..EngineConfig::default() };
        let (mut alice, _) = engine_with("alice", config).await;
        alice.create_channel("sn://dm", ChannelMeta::closed([peer("bob")])).await.unwrap();
        alice.append("sn://dm", b"psst").await.unwrap();
        alice.advance_era().await.unwrap();

        let sink = RecordingSink::new();
        alice.handle_interest(&interest_from(&alice, "bob"), &ctx("bob"), &sink).await.unwrap();
        let key = ChunkKey::new(Origin::Local, "sn://dm", Era(0));
        assert!(!alice.chunks().exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_state_restored_on_open() {
        let chunks: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        let states = Arc::new(MemoryStateStore::new());
        let format = Format::new("chat").unwrap();

        let mut first = SyncEngine::open(peer("alice"), format.clone(), EngineConfig::default(), chunks.clone(), states.clone())
            .await
            .unwrap();
        first.append("sn://chat", b"kept").await.unwrap();
        first.advance_era().await.unwrap();
        drop(first);

        let reopened = SyncEngine::open(peer("alice"), format, EngineConfig::default(), chunks, states)
            .await
            .unwrap();
        assert_eq!(reopened.era(), Era(1));
        assert_eq!(reopened.channels().await.unwrap(), vec!["sn://chat".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let mut alice = engine("alice").await;
        let err = alice.append("sn://chat", b"").await.unwrap_err();
        assert!(!err.is_fatal());
    }

    async fn assimilate(engine: &mut SyncEngine, header: &AssimilateHeader, messages: &[Bytes], remote: &str) -> bool {
        let bytes: Vec<u8> = messages.iter().flat_map(|part| part.iter().copied()).collect();
        let mut reader: &[u8] = &bytes;
        let mut payload = Payload::new(&mut reader, header.framing.payload_len);
        let stored = engine.handle_assimilate(header, &mut payload, &ctx(remote)).await.unwrap();
        payload.drain().await.unwrap();
        stored
    }

    #[tokio::test]
    async fn test_interest_persists_last_seen() {
        let (mut alice, states) = engine_with("alice", EngineConfig::default()).await;
        alice.append("sn://chat", b"hello").await.unwrap();
        alice.advance_era().await.unwrap();

        let sink = RecordingSink::new();
        alice.handle_interest(&interest_from(&alice, "bob"), &ctx("bob"), &sink).await.unwrap();

        let saved = states.load(alice.format()).await.unwrap().unwrap();
        assert_eq!(saved.last_seen.get(&peer("bob")), Some(&Era(1)));
        assert_eq!(saved.era, alice.era());
    }

    #[tokio::test]
    async fn test_live_assimilate_carries_whole_open_chunk() {
        let mut alice = engine("alice").await;
        alice.append("sn://chat", b"one").await.unwrap();
        alice.append("sn://chat", b"two").await.unwrap();

        let (header, messages) = alice.live_assimilate("sn://chat", &peer("bob")).await.unwrap().unwrap();
        assert_eq!(header.era, Era(0));
        assert_eq!(header.sender, Some(peer("alice")));
        assert_eq!(messages, vec![Bytes::from("one"), Bytes::from("two")]);
        assert_eq!(header.framing.message_lengths(), vec![3, 3]);

        alice.create_channel("sn://dm", ChannelMeta::closed([peer("carol")])).await.unwrap();
        alice.append("sn://dm", b"psst").await.unwrap();
        assert!(alice.live_assimilate("sn://dm", &peer("bob")).await.unwrap().is_none());
        assert!(alice.live_assimilate("sn://none", &peer("bob")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_growing_chunk_is_completed() {
        let mut alice = engine("alice").await;
        let mut bob = engine("bob").await;
        let events = Arc::new(Events::default());
        bob.listeners().register(events.clone());

        alice.append("sn://chat", b"one").await.unwrap();
        let (first, messages) = alice.live_assimilate("sn://chat", &peer("bob")).await.unwrap().unwrap();
        assert!(assimilate(&mut bob, &first, &messages, "alice").await);

        alice.append("sn://chat", b"two").await.unwrap();
        let (second, messages) = alice.live_assimilate("sn://chat", &peer("bob")).await.unwrap().unwrap();
        assert!(assimilate(&mut bob, &second, &messages, "alice").await);
        assert!(!assimilate(&mut bob, &second, &messages, "alice").await);

        // The closed era offers the whole chunk; only what is missing lands.
        alice.append("sn://chat", b"three").await.unwrap();
        alice.advance_era().await.unwrap();
        let sink = RecordingSink::new();
        alice.handle_interest(&interest_from(&alice, "bob"), &ctx("bob"), &sink).await.unwrap();
        assert_eq!(deliver(&mut bob, &sink, "alice").await, 1);

        let messages = bob.received_messages(&peer("alice"), "sn://chat").collect().await.unwrap();
        assert_eq!(messages, vec![Bytes::from("one"), Bytes::from("two"), Bytes::from("three")]);
        let counts: Vec<usize> = events.0.lock().unwrap().iter().map(|event| event.message_count).collect();
        assert_eq!(counts, vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_prepared_reply_skips_removed_chunks() {
        let mut alice = engine("alice").await;
        alice.append("sn://gone", b"bye").await.unwrap();
        alice.append("sn://kept", b"hi").await.unwrap();
        alice.advance_era().await.unwrap();

        let reply = alice.prepare_interest(&interest_from(&alice, "bob"), &ctx("bob")).await.unwrap();
        assert_eq!(reply.len(), 2);
        alice.remove_channel("sn://gone").await.unwrap();

        let sink = RecordingSink::new();
        assert_eq!(reply.send(&sink).await.unwrap(), 1);
        assert_eq!(sink.headers()[0].channel, "sn://kept");
        assert!(alice.state().last_seen.get(&peer("bob")).is_none());
        alice.complete_interest(&reply).await;
        assert_eq!(alice.state().last_seen.get(&peer("bob")), Some(&Era(1)));
    }

    #[tokio::test]
    async fn test_interest_reports_last_seen() {
        let mut alice = engine("alice").await;
        let sink = RecordingSink::new();
        let mut incoming = interest_from(&alice, "bob");
        incoming.encounters = Some(BTreeMap::from([(peer("carol"), Era(9))]));
        alice.handle_interest(&incoming, &ctx("bob"), &sink).await.unwrap();

        assert_eq!(alice.reported_encounters(&peer("bob")).unwrap().get(&peer("carol")), Some(&Era(9)));
        let outgoing = alice.interest(&peer("bob"));
        assert_eq!(outgoing.encounters.unwrap().get(&peer("bob")), Some(&Era(0)));
        assert_eq!(outgoing.era_to, Some(Era(0)));
    }
}
