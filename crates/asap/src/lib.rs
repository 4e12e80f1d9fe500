//! # ASAP
//!
//! Era-based opportunistic message synchronization between peers that
//! meet only now and then.
//!
//! ## Overview
//!
//! A [`Peer`] owns one sync engine per application format. Applications
//! append messages to channels; whenever the peer encounters another peer,
//! the open era is closed and every closed chunk the other side has not seen
//! yet is sent over. Peers that allow routing carry content on behalf of
//! third parties, recording one hop per relay step.
//!
//! ## Key Concepts
//!
//! - **Era**: a circular counter bounding one synchronization window.
//! - **Chunk**: the messages of one channel within one era.
//! - **Encounter**: an admitted connection between two peers, running one
//!   session.
//! - **Hop**: the attestation of one relay step.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use asap::{Peer, PeerConfig};
//! use asap::core::{Format, PeerId};
//!
//! async fn example(stream: tokio::io::DuplexStream) {
//!     let peer = Peer::new(PeerId::new("alice").unwrap(), PeerConfig::default());
//!     let chat = Format::new("chat").unwrap();
//!     peer.add_format(chat.clone()).await.unwrap();
//!
//!     peer.append(&chat, "sn://chat/general", b"hello").await.unwrap();
//!
//!     let (reader, writer) = tokio::io::split(stream);
//!     let session = peer.handle_encounter(reader, writer, "10.0.0.2:7000", true).await.unwrap();
//!     session.terminated().await;
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `asap::core` - Eras, identifiers, channel metadata, crypto
//! - `asap::store` - Chunk storage and state persistence
//! - `asap::sync` - Wire codec, engines, sessions, encounters

pub mod error;
pub mod peer;

// Re-export component crates
pub use asap_core as core;
pub use asap_store as store;
pub use asap_sync as sync;

// Re-export main types for convenience
pub use error::{PeerError, Result};
pub use peer::{Peer, PeerConfig};

// Re-export commonly used types
pub use asap_core::{ChannelMeta, Crypto, Ed25519Crypto, Era, Format, Hop, Keypair, Medium, NoCrypto, PeerId};
pub use asap_sync::{
    ChunkReceived, ChunkReceivedListener, ConnectionListener, LinkInfo, OnlinePeersListener,
    SessionHandle,
};
