//! # ASAP Testkit
//!
//! Testing utilities for ASAP sync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: in-memory engines and peers, peers connected over
//!   in-process duplex streams, recording sinks and listeners
//! - **Generators**: Proptest strategies for eras, identifiers and PDUs
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use asap_testkit::generators::era;
//!
//! proptest! {
//!     #[test]
//!     fn next_then_previous_is_identity(e in era()) {
//!         prop_assert_eq!(e.next().previous(), e);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! Quickly set up an encounter:
//!
//! ```rust,no_run
//! use asap::PeerConfig;
//! use asap_testkit::fixtures::{connect, memory_peer};
//!
//! async fn example() {
//!     let alice = memory_peer("alice", "chat", PeerConfig::default()).await;
//!     let bob = memory_peer("bob", "chat", PeerConfig::default()).await;
//!     let (to_bob, to_alice) = connect(&alice, &bob).await;
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    connect, disconnect, eventually, init_tracing, memory_engine, memory_peer, peer_id,
    RecordingChunks, RecordingConnections, RecordingOnline, RecordingSink,
};
