//! # ASAP Sync
//!
//! Era-based opportunistic synchronization between peers that meet only
//! occasionally.
//!
//! ## Overview
//!
//! Each application format has one [`SyncEngine`]. Local content is appended
//! into the engine's open era; when an encounter starts the era is closed and
//! everything closed is offered to the remote peer, once. Peers that allow
//! routing also receive content the local peer stored on behalf of others.
//!
//! ## Key Properties
//!
//! - **Once per peer**: a chunk is never sent twice to the same peer
//! - **Closed eras on encounter**: INTEREST answers never include the open
//!   era; while connected, appends reach the peer as live pushes
//! - **Idempotent ingest**: re-delivered chunks are dropped, a chunk that
//!   grew only adds its new messages
//! - **No echo**: routed content never goes back to its sender
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use asap_core::{Format, NoCrypto, PeerId};
//! use asap_store::{MemoryChunkStore, MemoryStateStore};
//! use asap_sync::{EngineConfig, EngineRegistry, LinkInfo, SessionContext, SyncConfig, SyncEngine};
//! use asap_core::Medium;
//!
//! async fn example(stream: tokio::io::DuplexStream) {
//!     let alice = PeerId::new("alice").unwrap();
//!     let format = Format::new("chat").unwrap();
//!
//!     let mut engine = SyncEngine::open(
//!         alice,
//!         format.clone(),
//!         EngineConfig::default(),
//!         Arc::new(MemoryChunkStore::new()),
//!         Arc::new(MemoryStateStore::new()),
//!     )
//!     .await
//!     .unwrap();
//!     engine.append("sn://chat/general", b"hello").await.unwrap();
//!     engine.advance_era().await.unwrap();
//!
//!     let engines = EngineRegistry::new();
//!     engines.insert(format, engine.into_handle());
//!
//!     let context = SessionContext::new(SyncConfig::default(), engines, Arc::new(NoCrypto));
//!     let (reader, writer) = tokio::io::split(stream);
//!     let session = context.start(PeerId::new("bob").unwrap(), LinkInfo::new(Medium::Internet), reader, writer);
//!     session.terminated().await;
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Peer A                              Peer B
//!   |-------- INTEREST (per format) -->|
//!   |<------- INTEREST (per format) ---|
//!   |<------- ASSIMILATE (chunk) ------|
//!   |<------- ASSIMILATE (chunk) ------|
//!   |-------- ASSIMILATE (chunk) ----->|
//!   |         ... until either side closes or goes quiet
//! ```

pub mod codec;
pub mod config;
pub mod encounter;
pub mod engine;
pub mod error;
pub mod listener;
pub mod pdu;
pub mod session;

pub use codec::{read_pdu, write_pdu, Inbound, Payload, PduSink};
pub use config::{EncounterConfig, EngineConfig, SyncConfig};
pub use encounter::{tie_break, Admitted, EncounterManager, OnlinePeersListener, TieBreak};
pub use engine::{
    AdmitAll, ChannelAdmission, ChunkReceived, ChunkReceivedListener, EngineHandle,
    EngineRegistry, InterestReply, ReceiveContext, SyncEngine,
};
pub use error::{Result, SyncError};
pub use listener::{ListenerId, ListenerRegistry};
pub use pdu::{AssimilateHeader, Framing, Interest, Pdu};
pub use session::{
    ConnectionListener, LinkInfo, SessionContext, SessionHandle, SessionState, SharedWriter,
};
