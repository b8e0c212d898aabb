//! The narrow torrent orchestrator contract (spec §4.4): synthesise a
//! torrent for a locally held layer, and download a layer described by a
//! peer's metainfo. Implemented by `accelerboat-torrent-engine` against the
//! libtorrent session binding.

use std::path::Path;

use async_trait::async_trait;

use crate::error::TorrentResult;

/// Synthesises and resolves torrents for layer files, keyed by digest rather
/// than by an engine-assigned id.
#[async_trait]
pub trait TorrentOrchestrator: Send + Sync {
    /// Copies `source_file` into the torrent directory, builds a metainfo
    /// sized for it, registers it with the engine, and waits for the engine
    /// to report the torrent's info dictionary before returning.
    ///
    /// Idempotent: calling this twice for the same `digest` returns the same
    /// base64 metainfo without creating a second torrent.
    async fn generate(&self, digest: &str, source_file: &Path) -> TorrentResult<String>;

    /// Decodes `metainfo_base64`, adds it to the engine, and drives the
    /// download to completion at `dest_path`.
    async fn download(
        &self,
        digest: &str,
        metainfo_base64: &str,
        dest_path: &Path,
    ) -> TorrentResult<()>;

    /// Removes a previously generated or downloaded torrent and stops
    /// seeding it. Optional: engines that always seed until process exit
    /// may decline.
    async fn remove(&self, digest: &str) -> TorrentResult<()> {
        let _ = digest;
        Err(crate::error::TorrentError::Unsupported {
            operation: "remove",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TorrentError;
    use std::path::PathBuf;

    struct StubOrchestrator;

    #[async_trait]
    impl TorrentOrchestrator for StubOrchestrator {
        async fn generate(&self, digest: &str, _source_file: &Path) -> TorrentResult<String> {
            Ok(format!("metainfo-for-{digest}"))
        }

        async fn download(
            &self,
            _digest: &str,
            _metainfo_base64: &str,
            _dest_path: &Path,
        ) -> TorrentResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn remove_defaults_to_unsupported() {
        let orchestrator = StubOrchestrator;
        let err = orchestrator.remove("digest").await.unwrap_err();
        assert!(matches!(err, TorrentError::Unsupported { operation } if operation == "remove"));
    }

    #[tokio::test]
    async fn generate_and_download_are_callable() {
        let orchestrator = StubOrchestrator;
        let metainfo = orchestrator
            .generate("digest", &PathBuf::from("/tmp/layer"))
            .await
            .expect("generate");
        assert_eq!(metainfo, "metainfo-for-digest");
        orchestrator
            .download("digest", &metainfo, &PathBuf::from("/tmp/dest"))
            .await
            .expect("download");
    }
}
