//! Error types for the torrent orchestrator.

use std::error::Error;

use thiserror::Error;

/// Primary error type for torrent operations.
#[derive(Debug, Error)]
pub enum TorrentError {
    /// Operation is not supported by the underlying engine.
    #[error("torrent operation not supported")]
    Unsupported {
        /// Operation identifier.
        operation: &'static str,
    },
    /// Operation failed in the underlying engine.
    #[error("torrent operation failed")]
    OperationFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Digest the operation was acting on, when available.
        digest: Option<String>,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// `Generate` did not see the library register the torrent after the
    /// configured number of retries.
    #[error("torrent generation did not register after retries")]
    GenerateRetryExhausted {
        /// Digest that failed to generate.
        digest: String,
        /// Number of attempts made.
        attempts: u32,
    },
    /// `Download` observed zero bytes completed for the "no start" timeout.
    #[error("torrent download never started")]
    NoStart {
        /// Digest that failed to start.
        digest: String,
    },
    /// `Download` observed no progress for the "no speed" timeout after
    /// having made some.
    #[error("torrent download stalled")]
    NoSpeed {
        /// Digest that stalled.
        digest: String,
    },
    /// The completed download file is sparse (logical size more than 10x the
    /// allocated physical blocks), indicating a verify race.
    #[error("torrent download produced a sparse file")]
    SparseFile {
        /// Digest whose file was sparse.
        digest: String,
    },
    /// Metainfo failed to base64/JSON round-trip.
    #[error("torrent metainfo serialization failed")]
    Serialization {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Torrent was not found.
    #[error("torrent not found")]
    NotFound {
        /// Missing digest.
        digest: String,
    },
}

/// Convenience alias for torrent operation results.
pub type TorrentResult<T> = Result<T, TorrentError>;
