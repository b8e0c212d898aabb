//! Torrent domain types: metainfo, piece-length choice, and handle state.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;

/// Smallest piece length the chooser will pick, in bytes.
const MIN_PIECE_LENGTH: u64 = 16 * 1024;
/// Largest piece length the chooser will pick, in bytes.
const MAX_PIECE_LENGTH: u64 = 16 * 1024 * 1024;
/// Target upper bound on piece count; the chooser doubles the piece length
/// until the file fits within roughly this many pieces.
const TARGET_PIECE_COUNT: u64 = 2000;

/// Chooses a piece length for a file of `size` bytes, doubling from
/// [`MIN_PIECE_LENGTH`] until the piece count falls under
/// [`TARGET_PIECE_COUNT`], capped at [`MAX_PIECE_LENGTH`].
#[must_use]
pub fn choose_piece_length(size: u64) -> u64 {
    let mut piece_length = MIN_PIECE_LENGTH;
    while piece_length < MAX_PIECE_LENGTH && size / piece_length > TARGET_PIECE_COUNT {
        piece_length *= 2;
    }
    piece_length
}

/// Minimal single-file metainfo: one announce URL, a piece length, and the
/// total length. Synthesised by `Generate` and round-tripped through
/// base64 across the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metainfo {
    /// Digest of the layer this torrent carries.
    pub digest: String,
    /// Single tracker announce URL.
    pub announce: String,
    /// Chosen piece length in bytes.
    pub piece_length: u64,
    /// Total length of the underlying file in bytes.
    pub length: u64,
}

impl Metainfo {
    /// Builds a metainfo for `digest`/`announce` sized for `length` bytes.
    #[must_use]
    pub fn new(digest: impl Into<String>, announce: impl Into<String>, length: u64) -> Self {
        Self {
            digest: digest.into(),
            announce: announce.into(),
            piece_length: choose_piece_length(length),
            length,
        }
    }

    /// Encodes this metainfo as base64(JSON), the wire form returned by
    /// `Generate` and accepted by `Download`.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self) -> Result<String, TorrentError> {
        let bytes = serde_json::to_vec(self).map_err(|source| TorrentError::Serialization {
            operation: "metainfo_encode",
            source: Box::new(source),
        })?;
        Ok(BASE64.encode(bytes))
    }

    /// Decodes a metainfo previously produced by [`Metainfo::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or the decoded
    /// bytes are not a valid metainfo document.
    pub fn decode(base64_metainfo: &str) -> Result<Self, TorrentError> {
        let bytes =
            BASE64
                .decode(base64_metainfo)
                .map_err(|source| TorrentError::Serialization {
                    operation: "metainfo_decode_base64",
                    source: Box::new(source),
                })?;
        serde_json::from_slice(&bytes).map_err(|source| TorrentError::Serialization {
            operation: "metainfo_decode_json",
            source: Box::new(source),
        })
    }
}

/// One-to-one with a layer file under the torrent directory: a digest's
/// metainfo plus its current piece-progress fraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TorrentHandle {
    /// Digest this handle was generated for.
    pub digest: String,
    /// Metainfo synthesised for this handle.
    pub metainfo: Metainfo,
    /// Fraction of pieces verified, in `[0.0, 1.0]`.
    pub piece_progress: f32,
    /// Whether the engine has reported `GotInfo` for this handle.
    pub got_info: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_length_grows_with_size() {
        assert_eq!(choose_piece_length(0), MIN_PIECE_LENGTH);
        assert_eq!(choose_piece_length(1024), MIN_PIECE_LENGTH);
        assert!(choose_piece_length(50 * 1024 * 1024 * 1024) <= MAX_PIECE_LENGTH);
        assert!(choose_piece_length(1) <= choose_piece_length(100 * 1024 * 1024 * 1024));
    }

    #[test]
    fn metainfo_round_trips_through_base64() {
        let meta = Metainfo::new("abc123", "http://origin/announce", 42 * 1024 * 1024);
        let encoded = meta.encode().expect("encode");
        let decoded = Metainfo::decode(&encoded).expect("decode");
        assert_eq!(meta, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Metainfo::decode("not base64 at all!!").is_err());
    }
}
