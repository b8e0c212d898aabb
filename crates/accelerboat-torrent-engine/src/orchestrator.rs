//! Drives a [`session::LibTorrentSession`] to implement
//! `accelerboat_torrent_core::TorrentOrchestrator` (spec §4.4).
//!
//! Every operation is serialized per digest so a concurrent `generate` and
//! `download` for the same layer never race the underlying session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use accelerboat_torrent_core::{Metainfo, TorrentError, TorrentResult, choose_piece_length};
use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::session::{self, LibTorrentSession, SessionEvent, SessionOptions};

const GENERATE_MAX_ATTEMPTS: u32 = 3;
const GOT_INFO_POLL_INTERVAL: Duration = Duration::from_millis(250);
const GOT_INFO_TIMEOUT: Duration = Duration::from_secs(30);
const PROGRESS_TICK: Duration = Duration::from_secs(5);
const NO_START_TIMEOUT: Duration = Duration::from_secs(180);
const NO_SPEED_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_CONCURRENCY: usize = 10;
const SPARSE_RATIO: u64 = 10;

/// `TorrentOrchestrator` implementation backed by a single libtorrent session
/// shared across all digests, with per-digest exclusion and a bounded
/// download concurrency.
pub struct LibtorrentOrchestrator {
    session: Arc<Mutex<Box<dyn LibTorrentSession>>>,
    digest_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    generated: Mutex<HashMap<String, String>>,
    download_slots: Arc<Semaphore>,
    announce: String,
    torrent_dir: PathBuf,
}

impl LibtorrentOrchestrator {
    /// Constructs the orchestrator. `torrent_dir` is where generated
    /// torrents' source copies live; `announce` is the tracker URL embedded
    /// in every metainfo this node produces.
    pub fn new(download_root: String, torrent_dir: PathBuf, announce: String) -> anyhow::Result<Self> {
        let session = session::create_session(SessionOptions {
            download_root,
            resume_dir: torrent_dir.to_string_lossy().into_owned(),
        })?;
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            digest_locks: Mutex::new(HashMap::new()),
            generated: Mutex::new(HashMap::new()),
            download_slots: Arc::new(Semaphore::new(DOWNLOAD_CONCURRENCY)),
            announce,
            torrent_dir,
        })
    }

    async fn digest_lock(&self, digest: &str) -> Arc<Mutex<()>> {
        let mut locks = self.digest_locks.lock().await;
        locks
            .entry(digest.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn digest_hex(digest: &str) -> &str {
        digest.strip_prefix("sha256:").unwrap_or(digest)
    }

    async fn wait_for_got_info(&self, digest: &str) -> TorrentResult<()> {
        let deadline = Instant::now() + GOT_INFO_TIMEOUT;
        loop {
            let events = {
                let mut session = self.session.lock().await;
                session.poll_events().await.map_err(|err| {
                    crate::op_failed("poll_events", Some(digest.to_string()), anyhow_to_io(err))
                })?
            };
            for event in events {
                if let SessionEvent::GotInfo { digest: got } = &event {
                    if got == digest {
                        return Ok(());
                    }
                }
                if let SessionEvent::Error {
                    digest: failed,
                    message,
                } = &event
                {
                    if failed == digest {
                        return Err(TorrentError::OperationFailed {
                            operation: "wait_for_got_info",
                            digest: Some(digest.to_string()),
                            source: message.clone().into(),
                        });
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(TorrentError::NotFound {
                    digest: digest.to_string(),
                });
            }
            tokio::time::sleep(GOT_INFO_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl accelerboat_torrent_core::TorrentOrchestrator for LibtorrentOrchestrator {
    async fn generate(&self, digest: &str, source_file: &Path) -> TorrentResult<String> {
        let lock = self.digest_lock(digest).await;
        let _guard = lock.lock().await;

        if let Some(cached) = self.generated.lock().await.get(digest) {
            return Ok(cached.clone());
        }

        let metadata = tokio::fs::metadata(source_file).await.map_err(|err| {
            crate::op_failed("generate_stat", Some(digest.to_string()), err)
        })?;
        let length = metadata.len();
        let piece_length = choose_piece_length(length);

        let target = self.torrent_dir.join(format!("{}.tar.gzip", Self::digest_hex(digest)));
        tokio::fs::copy(source_file, &target).await.map_err(|err| {
            crate::op_failed("generate_copy", Some(digest.to_string()), err)
        })?;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            {
                let mut session = self.session.lock().await;
                session
                    .create_torrent(
                        digest,
                        &target.to_string_lossy(),
                        &self.announce,
                        piece_length,
                    )
                    .await
                    .map_err(|err| {
                        crate::op_failed("create_torrent", Some(digest.to_string()), anyhow_to_io(err))
                    })?;
            }

            match self.wait_for_got_info(digest).await {
                Ok(()) => break,
                Err(_) if attempts < GENERATE_MAX_ATTEMPTS => {
                    warn!(digest, attempts, "torrent registration did not resolve, retrying");
                    continue;
                }
                Err(_) => {
                    return Err(TorrentError::GenerateRetryExhausted {
                        digest: digest.to_string(),
                        attempts,
                    });
                }
            }
        }

        let metainfo = Metainfo::new(digest, self.announce.clone(), length);
        let encoded = metainfo.encode()?;
        self.generated
            .lock()
            .await
            .insert(digest.to_string(), encoded.clone());
        debug!(digest, length, "torrent generated");
        Ok(encoded)
    }

    async fn download(
        &self,
        digest: &str,
        metainfo_base64: &str,
        dest_path: &Path,
    ) -> TorrentResult<()> {
        let lock = self.digest_lock(digest).await;
        let _guard = lock.lock().await;

        let metainfo = Metainfo::decode(metainfo_base64)?;
        let _permit = self.download_slots.acquire().await.map_err(|err| {
            TorrentError::OperationFailed {
                operation: "acquire_download_slot",
                digest: Some(digest.to_string()),
                source: Box::new(err),
            }
        })?;

        let staging = dest_path.with_extension("part");
        {
            let mut session = self.session.lock().await;
            session
                .add_from_metainfo(
                    digest,
                    &metainfo.announce,
                    metainfo.piece_length,
                    metainfo.length,
                    &staging.to_string_lossy(),
                )
                .await
                .map_err(|err| {
                    crate::op_failed("add_from_metainfo", Some(digest.to_string()), anyhow_to_io(err))
                })?;
        }

        let start = Instant::now();
        let mut last_progress_at = start;
        let mut last_bytes_completed = 0u64;
        let mut ticker = tokio::time::interval(PROGRESS_TICK);

        loop {
            ticker.tick().await;
            let events = {
                let mut session = self.session.lock().await;
                session.poll_events().await.map_err(|err| {
                    crate::op_failed("poll_events", Some(digest.to_string()), anyhow_to_io(err))
                })?
            };

            let mut completed = false;
            for event in events {
                match event {
                    SessionEvent::Progress {
                        digest: got,
                        bytes_completed,
                        ..
                    } if got == digest => {
                        if bytes_completed > last_bytes_completed {
                            last_bytes_completed = bytes_completed;
                            last_progress_at = Instant::now();
                        }
                    }
                    SessionEvent::Completed { digest: got } if got == digest => completed = true,
                    SessionEvent::Error {
                        digest: got,
                        message,
                    } if got == digest => {
                        return Err(TorrentError::OperationFailed {
                            operation: "download",
                            digest: Some(digest.to_string()),
                            source: message.into(),
                        });
                    }
                    _ => {}
                }
            }

            if completed {
                break;
            }

            let now = Instant::now();
            if last_bytes_completed == 0 && now.duration_since(start) >= NO_START_TIMEOUT {
                return Err(TorrentError::NoStart {
                    digest: digest.to_string(),
                });
            }
            if last_bytes_completed > 0 && now.duration_since(last_progress_at) >= NO_SPEED_TIMEOUT {
                return Err(TorrentError::NoSpeed {
                    digest: digest.to_string(),
                });
            }
        }

        if is_sparse(&staging).await {
            return Err(TorrentError::SparseFile {
                digest: digest.to_string(),
            });
        }

        tokio::fs::rename(&staging, dest_path).await.map_err(|err| {
            crate::op_failed("download_rename", Some(digest.to_string()), err)
        })?;
        debug!(digest, "torrent download complete");
        Ok(())
    }

    async fn remove(&self, digest: &str) -> TorrentResult<()> {
        let lock = self.digest_lock(digest).await;
        let _guard = lock.lock().await;
        let mut session = self.session.lock().await;
        session
            .remove_torrent(digest)
            .await
            .map_err(|err| crate::op_failed("remove_torrent", Some(digest.to_string()), anyhow_to_io(err)))?;
        self.generated.lock().await.remove(digest);
        Ok(())
    }
}

#[cfg(unix)]
async fn is_sparse(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            let logical = metadata.len();
            let physical = metadata.blocks() * 512;
            physical > 0 && logical > physical.saturating_mul(SPARSE_RATIO)
        }
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn is_sparse(_path: &Path) -> bool {
    false
}

fn anyhow_to_io(err: anyhow::Error) -> std::io::Error {
    std::io::Error::other(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelerboat_torrent_core::TorrentOrchestrator as _;
    use tempfile::tempdir;

    async fn orchestrator(dir: &Path) -> LibtorrentOrchestrator {
        LibtorrentOrchestrator::new(
            dir.to_string_lossy().into_owned(),
            dir.to_path_buf(),
            "udp://tracker.local:6969/announce".to_string(),
        )
        .expect("orchestrator construction")
    }

    #[tokio::test]
    async fn generate_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("layer.tar.gzip");
        tokio::fs::write(&source, b"hello world").await.expect("write source");

        let orchestrator = orchestrator(dir.path()).await;
        let first = orchestrator
            .generate("sha256:abc123", &source)
            .await
            .expect("first generate");
        let second = orchestrator
            .generate("sha256:abc123", &source)
            .await
            .expect("second generate");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn generate_then_download_round_trips() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("layer.tar.gzip");
        tokio::fs::write(&source, vec![7u8; 4096]).await.expect("write source");

        let orchestrator = orchestrator(dir.path()).await;
        let metainfo = orchestrator
            .generate("sha256:def456", &source)
            .await
            .expect("generate");

        let dest = dir.path().join("downloaded.tar.gzip");
        orchestrator
            .download("sha256:def456", &metainfo, &dest)
            .await
            .expect("download");
        assert!(dest.exists());
    }
}
