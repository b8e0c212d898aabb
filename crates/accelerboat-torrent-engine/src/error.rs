//! # Design
//!
//! - Centralize libtorrent adapter error context without using `anyhow`.
//! - Keep error messages constant; store operational context in fields.
//! - Provide helpers to build `TorrentError` with structured sources.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use accelerboat_torrent_core::TorrentError;

#[derive(Debug)]
/// Internal error details used by the libtorrent adapter.
pub enum LibtorrentError {
    /// A required field was missing from a request payload.
    MissingField {
        /// Field name that was missing.
        field: &'static str,
    },
    /// A request contained an invalid field value.
    InvalidInput {
        /// Field name with an invalid value.
        field: &'static str,
        /// Static reason describing the invalid value.
        reason: &'static str,
    },
    /// The libtorrent session was unavailable for the requested operation.
    SessionUnavailable {
        /// Operation that could not be serviced.
        operation: &'static str,
    },
    /// A native libtorrent call reported a failure.
    NativeFailure {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Native error message payload.
        message: String,
    },
}

impl Display for LibtorrentError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => {
                let _ = field;
                formatter.write_str("required field missing")
            }
            Self::InvalidInput { field, reason } => {
                let _ = (field, reason);
                formatter.write_str("invalid torrent input")
            }
            Self::SessionUnavailable { operation } => {
                let _ = operation;
                formatter.write_str("libtorrent session unavailable")
            }
            Self::NativeFailure { operation, message } => {
                let _ = (operation, message);
                formatter.write_str("libtorrent native error")
            }
        }
    }
}

impl Error for LibtorrentError {}

/// Build a torrent error with structured operation context.
pub fn op_failed(
    operation: &'static str,
    digest: Option<String>,
    source: impl Error + Send + Sync + 'static,
) -> TorrentError {
    TorrentError::OperationFailed {
        operation,
        digest,
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn libtorrent_error_display() {
        let cases = vec![
            (
                LibtorrentError::MissingField { field: "path" },
                "required field missing",
            ),
            (
                LibtorrentError::InvalidInput {
                    field: "sample",
                    reason: "too large",
                },
                "invalid torrent input",
            ),
            (
                LibtorrentError::SessionUnavailable {
                    operation: "add_torrent",
                },
                "libtorrent session unavailable",
            ),
            (
                LibtorrentError::NativeFailure {
                    operation: "add_torrent",
                    message: "native error".to_string(),
                },
                "libtorrent native error",
            ),
        ];

        for (err, message) in cases {
            assert_eq!(err.to_string(), message);
        }
    }

    #[test]
    fn op_failed_wraps_torrent_error() -> Result<(), Box<dyn Error>> {
        let err = op_failed(
            "add",
            Some("sha256:abc".to_string()),
            io::Error::other("io"),
        );
        match err {
            TorrentError::OperationFailed {
                operation,
                digest: Some(digest),
                source,
            } => {
                assert_eq!(operation, "add");
                assert_eq!(digest, "sha256:abc");
                assert_eq!(source.to_string(), "io");
                Ok(())
            }
            _ => Err(io::Error::other("expected operation failed").into()),
        }
    }
}
