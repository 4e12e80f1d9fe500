//! # ASAP Core
//!
//! Pure model types for era-based opportunistic synchronization.
//!
//! This crate contains no I/O, no storage, no networking. Everything here is
//! plain data plus the arithmetic the sync engine relies on.
//!
//! ## Key Types
//!
//! - [`Era`] - Circular epoch counter bounding one synchronization window
//! - [`PeerId`] / [`Format`] - Strongly typed identifiers
//! - [`ChannelMeta`] - Owner, recipients and extra metadata of a channel
//! - [`Hop`] - One point-to-point relay attestation
//! - [`EngineState`] - The durable checkpoint of one sync engine
//! - [`Crypto`] - Pluggable signing/verification collaborator
//!
//! ## Eras
//!
//! Eras are not a clock. They order *recent* history only and wrap around at
//! `u32::MAX`. Every range computation goes through [`Era::is_within`] or
//! [`Era::distance_to`], never through `<` on raw values.

pub mod channel;
pub mod crypto;
pub mod era;
pub mod error;
pub mod hop;
pub mod state;
pub mod types;

pub use channel::ChannelMeta;
pub use crypto::{Crypto, Ed25519Crypto, Keypair, NoCrypto};
pub use era::Era;
pub use error::{CoreError, Result};
pub use hop::{Hop, Medium};
pub use state::EngineState;
pub use types::{Format, PeerId};
