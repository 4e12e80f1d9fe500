//! # ASAP Store
//!
//! Chunk storage and engine-state persistence for ASAP sync engines.
//!
//! ## Overview
//!
//! A sync engine owns one [`ChunkStore`] for its format. The store holds
//! chunks keyed by ([`Origin`], uri, era): locally appended content lives
//! under [`Origin::Local`], content received from a remote end-to-end sender
//! under [`Origin::Received`]. The engine's era bookkeeping is persisted
//! through a [`StateStore`].
//!
//! ## Key Types
//!
//! - [`ChunkStore`] - The async trait for chunk operations
//! - [`StateStore`] - Load/save of [`asap_core::EngineState`]
//! - [`SqliteChunkStore`] - SQLite-based durable storage (implements both)
//! - [`MemoryChunkStore`] / [`MemoryStateStore`] - In-memory storage for tests
//! - [`FileStateStore`] - CBOR snapshots with write-then-rename
//! - [`MessageCursor`] - Lazy, era-ordered message sequence
//!
//! ## Usage
//!
//! ```rust,no_run
//! use asap_core::Era;
//! use asap_store::{ChunkKey, ChunkStore, ChunkStoreExt, Origin, SqliteChunkStore};
//!
//! async fn example() {
//!     let store = SqliteChunkStore::open("chat.db").unwrap();
//!     let key = ChunkKey::new(Origin::Local, "sn://chat/general", Era(0));
//!     store.append_message(&key, b"hello").await.unwrap();
//!
//!     let mut cursor = store.messages_for(&Origin::Local, "sn://chat/general", Era(0), Era(0));
//!     while let Some(message) = cursor.next().await.unwrap() {
//!         println!("{} bytes", message.len());
//!     }
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Lazy creation**: appending to a missing chunk creates it
//! - **Monotonic delivery**: `mark_delivered` never un-delivers
//! - **Empty is normal**: asking for eras that hold nothing yields nothing

pub mod cursor;
pub mod error;
pub mod file;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use cursor::MessageCursor;
pub use error::{Result, StoreError};
pub use file::FileStateStore;
pub use memory::{MemoryChunkStore, MemoryStateStore};
pub use sqlite::SqliteChunkStore;
pub use traits::{ChunkInfo, ChunkKey, ChunkStore, ChunkStoreExt, Origin, StateStore};
