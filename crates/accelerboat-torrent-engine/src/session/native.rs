//! Native libtorrent session binding via `cxx`. Feature-gated; a host
//! without `libtorrent` installed uses `stub::StubSession` instead.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cxx::UniquePtr;

use crate::ffi::bridge::ffi;

use super::{LibTorrentSession, SessionEvent, SessionOptions};

pub(crate) struct NativeSession {
    inner: UniquePtr<ffi::Session>,
}

pub(crate) fn create_session(options: SessionOptions) -> Result<Box<dyn LibTorrentSession>> {
    let inner = ffi::new_session(&ffi::SessionOptions {
        download_root: options.download_root,
        resume_dir: options.resume_dir,
    });
    if inner.is_null() {
        return Err(anyhow!("libtorrent session construction returned null"));
    }
    Ok(Box::new(NativeSession { inner }))
}

#[async_trait]
impl LibTorrentSession for NativeSession {
    async fn create_torrent(
        &mut self,
        digest: &str,
        source_path: &str,
        announce: &str,
        piece_length: u64,
    ) -> Result<()> {
        let error = self
            .inner
            .pin_mut()
            .create_torrent(&ffi::CreateTorrentRequest {
                digest: digest.to_string(),
                source_path: source_path.to_string(),
                announce: announce.to_string(),
                piece_length,
            });
        if error.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("create_torrent failed for {digest}: {error}"))
        }
    }

    async fn add_from_metainfo(
        &mut self,
        digest: &str,
        announce: &str,
        piece_length: u64,
        length: u64,
        dest_path: &str,
    ) -> Result<()> {
        let error = self
            .inner
            .pin_mut()
            .add_from_metainfo(&ffi::AddFromMetainfoRequest {
                digest: digest.to_string(),
                announce: announce.to_string(),
                piece_length,
                length,
                dest_path: dest_path.to_string(),
            });
        if error.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("add_from_metainfo failed for {digest}: {error}"))
        }
    }

    async fn remove_torrent(&mut self, digest: &str) -> Result<()> {
        let error = self.inner.pin_mut().remove_torrent(digest);
        if error.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("remove_torrent failed for {digest}: {error}"))
        }
    }

    async fn poll_events(&mut self) -> Result<Vec<SessionEvent>> {
        let native = self.inner.pin_mut().poll_events();
        Ok(native
            .into_iter()
            .map(|event| {
                let digest = event.digest.clone();
                match event.kind {
                    ffi::NativeEventKind::GotInfo => SessionEvent::GotInfo { digest },
                    ffi::NativeEventKind::Progress => SessionEvent::Progress {
                        digest,
                        bytes_completed: event.bytes_completed,
                        bytes_total: event.bytes_total,
                    },
                    ffi::NativeEventKind::Completed => SessionEvent::Completed { digest },
                    _ => SessionEvent::Error {
                        digest,
                        message: event.message.clone(),
                    },
                }
            })
            .collect())
    }
}

// SAFETY: the underlying libtorrent session is accessed only through the
// single owning task that polls it; no concurrent native calls occur.
unsafe impl Send for NativeSession {}
