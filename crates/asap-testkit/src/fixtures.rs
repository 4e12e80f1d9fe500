//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: in-memory engines, recording
//! listeners and sinks, and peers connected over in-process duplex streams.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use asap::{Peer, PeerConfig};
use asap_core::{Format, PeerId};
use asap_store::{MemoryChunkStore, MemoryStateStore};
use asap_sync::{
    AssimilateHeader, ChunkReceived, ChunkReceivedListener, ConnectionListener, EngineConfig,
    OnlinePeersListener, Pdu, PduSink, SessionHandle, SyncEngine, SyncError,
};

/// Buffer size of the in-process connections.
pub const DUPLEX_BUFFER: usize = 64 * 1024;

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

/// Peer id from a literal.
pub fn peer_id(id: &str) -> PeerId {
    PeerId::new(id).unwrap()
}

/// Format from a literal.
pub fn format(name: &str) -> Format {
    Format::new(name).unwrap()
}

/// An engine of `owner` backed by memory stores.
pub async fn memory_engine(owner: &str, format_name: &str, config: EngineConfig) -> SyncEngine {
    SyncEngine::open(
        peer_id(owner),
        format(format_name),
        config,
        Arc::new(MemoryChunkStore::new()),
        Arc::new(MemoryStateStore::new()),
    )
    .await
    .unwrap()
}

/// A peer with in-memory storage and one registered format.
pub async fn memory_peer(id: &str, format_name: &str, config: PeerConfig) -> Peer {
    let peer = Peer::new(peer_id(id), config);
    peer.add_format(format(format_name)).await.unwrap();
    peer
}

/// Run an encounter between `initiator` and `responder` over a duplex stream.
///
/// Returns the session handles of both ends.
pub async fn connect(initiator: &Peer, responder: &Peer) -> (SessionHandle, SessionHandle) {
    let (left, right) = tokio::io::duplex(DUPLEX_BUFFER);
    let (left_reader, left_writer) = tokio::io::split(left);
    let (right_reader, right_writer) = tokio::io::split(right);

    let responder_address = responder.id().to_string();
    let initiator_address = initiator.id().to_string();
    let (a, b) = tokio::join!(
        initiator.handle_encounter(left_reader, left_writer, &responder_address, true),
        responder.handle_encounter(right_reader, right_writer, &initiator_address, false),
    );
    (a.unwrap(), b.unwrap())
}

/// Kill both sessions of an encounter and wait until they are gone.
pub async fn disconnect(sessions: (SessionHandle, SessionHandle)) {
    sessions.0.kill();
    sessions.1.kill();
    sessions.0.terminated().await;
    sessions.1.terminated().await;
}

/// Poll `check` until it holds, panicking after about two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// A [`PduSink`] that keeps everything sent to it.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(Pdu, Vec<Bytes>)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers of the ASSIMILATE PDUs sent so far.
    pub fn assimilated(&self) -> Vec<AssimilateHeader> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(pdu, _)| match pdu {
                Pdu::Assimilate(header) => Some(header.clone()),
                Pdu::Interest(_) => None,
            })
            .collect()
    }

    /// Take every recorded PDU.
    pub fn take(&self) -> Vec<(Pdu, Vec<Bytes>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl PduSink for RecordingSink {
    async fn send(&self, pdu: &Pdu, payload: &[Bytes]) -> asap_sync::Result<()> {
        self.sent.lock().unwrap().push((pdu.clone(), payload.to_vec()));
        Ok(())
    }
}

/// Records stored chunks.
#[derive(Default)]
pub struct RecordingChunks {
    events: Mutex<Vec<ChunkReceived>>,
}

impl RecordingChunks {
    pub fn events(&self) -> Vec<ChunkReceived> {
        self.events.lock().unwrap().clone()
    }
}

impl ChunkReceivedListener for RecordingChunks {
    fn chunk_received(&self, event: &ChunkReceived) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Records session lifecycles.
#[derive(Default)]
pub struct RecordingConnections {
    started: Mutex<Vec<PeerId>>,
    terminated: Mutex<Vec<(PeerId, String)>>,
}

impl RecordingConnections {
    pub fn started(&self) -> Vec<PeerId> {
        self.started.lock().unwrap().clone()
    }

    /// Remote peer and the `Debug` rendering of the reason, per termination.
    pub fn terminated(&self) -> Vec<(PeerId, String)> {
        self.terminated.lock().unwrap().clone()
    }
}

impl ConnectionListener for RecordingConnections {
    fn session_started(&self, session: &SessionHandle) {
        self.started.lock().unwrap().push(session.remote().clone());
    }

    fn session_terminated(&self, session: &SessionHandle, reason: &SyncError) {
        self.terminated
            .lock()
            .unwrap()
            .push((session.remote().clone(), format!("{:?}", reason)));
    }
}

/// Records every online-peers notification.
#[derive(Default)]
pub struct RecordingOnline {
    changes: Mutex<Vec<Vec<PeerId>>>,
}

impl RecordingOnline {
    pub fn changes(&self) -> Vec<Vec<PeerId>> {
        self.changes.lock().unwrap().clone()
    }
}

impl OnlinePeersListener for RecordingOnline {
    fn online_peers_changed(&self, peers: &[PeerId]) {
        self.changes.lock().unwrap().push(peers.to_vec());
    }
}
