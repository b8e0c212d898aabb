//! In-memory double for `LibTorrentSession`, used when the `libtorrent`
//! feature is off (default for tests and for hosts without the native lib).

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use super::{LibTorrentSession, SessionEvent};

#[derive(Debug, Default)]
struct Entry {
    bytes_total: u64,
    bytes_completed: u64,
    got_info_sent: bool,
    completed_sent: bool,
}

/// Immediately resolves `GotInfo` and completes downloads in a single poll,
/// so orchestrator tests don't need a real libtorrent session.
#[derive(Debug, Default)]
pub(crate) struct StubSession {
    torrents: HashMap<String, Entry>,
}

#[async_trait]
impl LibTorrentSession for StubSession {
    async fn create_torrent(
        &mut self,
        digest: &str,
        _source_path: &str,
        _announce: &str,
        _piece_length: u64,
    ) -> Result<()> {
        self.torrents.insert(
            digest.to_string(),
            Entry {
                bytes_total: 1,
                bytes_completed: 1,
                ..Entry::default()
            },
        );
        Ok(())
    }

    async fn add_from_metainfo(
        &mut self,
        digest: &str,
        _announce: &str,
        _piece_length: u64,
        length: u64,
        _dest_path: &str,
    ) -> Result<()> {
        self.torrents.insert(
            digest.to_string(),
            Entry {
                bytes_total: length,
                bytes_completed: length,
                ..Entry::default()
            },
        );
        Ok(())
    }

    async fn remove_torrent(&mut self, digest: &str) -> Result<()> {
        self.torrents.remove(digest);
        Ok(())
    }

    async fn poll_events(&mut self) -> Result<Vec<SessionEvent>> {
        let mut events = Vec::new();
        for (digest, entry) in &mut self.torrents {
            if !entry.got_info_sent {
                entry.got_info_sent = true;
                events.push(SessionEvent::GotInfo {
                    digest: digest.clone(),
                });
            }
            if !entry.completed_sent {
                entry.completed_sent = true;
                events.push(SessionEvent::Progress {
                    digest: digest.clone(),
                    bytes_completed: entry.bytes_completed,
                    bytes_total: entry.bytes_total,
                });
                events.push(SessionEvent::Completed {
                    digest: digest.clone(),
                });
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_torrent_reports_got_info_then_completed() {
        let mut session = StubSession::default();
        session
            .create_torrent("sha256:abc", "/tmp/src", "udp://tracker", 16384)
            .await
            .expect("create");
        let events = session.poll_events().await.expect("poll");
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::GotInfo { digest } if digest == "sha256:abc")));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Completed { digest } if digest == "sha256:abc")));
    }

    #[tokio::test]
    async fn remove_torrent_drops_entry() {
        let mut session = StubSession::default();
        session
            .add_from_metainfo("sha256:def", "udp://tracker", 16384, 1024, "/tmp/dest")
            .await
            .expect("add");
        session.remove_torrent("sha256:def").await.expect("remove");
        assert!(session.torrents.is_empty());
    }
}
