//! Error types for the sync module.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while syncing.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Stream-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No PDU arrived within the read timeout.
    #[error("no data received for {0:?}")]
    Timeout(Duration),

    /// The remote peer closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] asap_store::StoreError),

    /// Invalid model value.
    #[error("core error: {0}")]
    Core(#[from] asap_core::CoreError),

    /// A local operation was given a value the protocol cannot carry.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No engine serves this format.
    #[error("unknown format: {0}")]
    UnknownFormat(String),

    /// The channel admission collaborator refused a channel, or the
    /// encounter manager refused a connection.
    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    /// The remote peer did not identify itself.
    #[error("peer did not identify itself")]
    PeerNotIdentified,

    /// The session was killed locally.
    #[error("session cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether this error ends the connection.
    ///
    /// Application errors (store failures, unknown formats, refused
    /// channels) are logged and the session keeps reading.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Protocol(_)
            | SyncError::Io(_)
            | SyncError::Timeout(_)
            | SyncError::Closed
            | SyncError::PeerNotIdentified
            | SyncError::Cancelled => true,
            SyncError::Store(_)
            | SyncError::Core(_)
            | SyncError::InvalidMessage(_)
            | SyncError::UnknownFormat(_)
            | SyncError::AdmissionDenied(_) => false,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(SyncError::Protocol("bad flags".into()).is_fatal());
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(SyncError::Closed.is_fatal());
        assert!(!SyncError::UnknownFormat("chat".into()).is_fatal());
        assert!(!SyncError::AdmissionDenied("sn://x".into()).is_fatal());
    }
}
