//! Error types for the peer facade.

use asap_core::{CoreError, Format};
use asap_store::StoreError;
use asap_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during peer operations.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Invalid identifier or crypto material.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// No engine is registered for the format.
    #[error("unknown format: {0}")]
    UnknownFormat(Format),

    /// An engine is already registered for the format.
    #[error("format already registered: {0}")]
    FormatExists(Format),
}

/// Result type for peer operations.
pub type Result<T> = std::result::Result<T, PeerError>;
