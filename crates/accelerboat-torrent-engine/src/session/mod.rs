#![allow(clippy::redundant_pub_crate)]

use anyhow::Result;
use async_trait::async_trait;

#[cfg(feature = "libtorrent")]
mod native;
#[cfg(any(test, not(feature = "libtorrent")))]
mod stub;

#[cfg(test)]
pub(crate) use stub::StubSession;

/// One polled event translated from the native session (or its stub).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionEvent {
    /// The engine has resolved the torrent's info dictionary.
    GotInfo { digest: String },
    /// Bytes-completed progress for an in-flight download.
    Progress {
        digest: String,
        bytes_completed: u64,
        bytes_total: u64,
    },
    /// The torrent finished downloading and verified.
    Completed { digest: String },
    /// The engine reported a failure for this torrent.
    Error { digest: String, message: String },
}

/// Narrow session abstraction: seed a locally produced torrent, or admit and
/// download one described by a peer's metainfo. Implemented by the native
/// libtorrent binding and, for tests, by an in-memory stub.
#[async_trait]
pub(crate) trait LibTorrentSession: Send {
    async fn create_torrent(
        &mut self,
        digest: &str,
        source_path: &str,
        announce: &str,
        piece_length: u64,
    ) -> Result<()>;

    async fn add_from_metainfo(
        &mut self,
        digest: &str,
        announce: &str,
        piece_length: u64,
        length: u64,
        dest_path: &str,
    ) -> Result<()>;

    async fn remove_torrent(&mut self, digest: &str) -> Result<()>;

    async fn poll_events(&mut self) -> Result<Vec<SessionEvent>>;
}

pub(crate) fn create_session(_options: SessionOptions) -> Result<Box<dyn LibTorrentSession>> {
    #[cfg(feature = "libtorrent")]
    {
        native::create_session(_options)
    }

    #[cfg(not(feature = "libtorrent"))]
    {
        Ok(Box::new(stub::StubSession::default()))
    }
}

/// Storage roots handed to the session on construction.
#[derive(Debug, Clone)]
pub(crate) struct SessionOptions {
    pub(crate) download_root: String,
    pub(crate) resume_dir: String,
}
