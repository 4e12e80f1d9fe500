//! Error types for the ASAP core model.

use thiserror::Error;

/// Errors raised while building or validating core model values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unknown medium tag: {0}")]
    UnknownMedium(u8),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid offsets: {0}")]
    InvalidOffsets(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
