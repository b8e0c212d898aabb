#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(unexpected_cfgs)]
#![allow(clippy::multiple_crate_versions)]

//! Cluster Cache Index: a digest-keyed directory of which cluster nodes hold
//! a usable copy of a given layer, backed by Postgres so every node observes
//! the same view.
//!
//! Entries are weak references — hints, not authoritative state. The
//! authoritative state is the file's presence on the holding node's disk;
//! the index is eventually consistent and self-heals via the 120-second
//! freshness window and probe-driven deletes.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::warn;

/// Entries older than this are considered expired and ignored on read.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(120);
/// Maximum holders returned per file-type category by [`CacheIndex::query_holders`].
pub const HOLDER_CAP: usize = 50;

/// Recognised file types for a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Downloaded and verified by this daemon.
    Static,
    /// Materialised from the local containerd content store.
    Containerd,
    /// Reserved for a future dockerd-backed holder.
    Dockerd,
}

impl FileType {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Containerd => "containerd",
            Self::Dockerd => "dockerd",
        }
    }

    fn from_sql(value: &str) -> Option<Self> {
        match value {
            "static" => Some(Self::Static),
            "containerd" => Some(Self::Containerd),
            "dockerd" => Some(Self::Dockerd),
            _ => None,
        }
    }
}

/// One holder of a layer, as returned by [`CacheIndex::query_holders`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    /// Endpoint (`ip:port`) of the node claiming to hold the layer.
    pub endpoint: String,
    /// Absolute path to the layer file on that node's disk.
    pub local_path: String,
    /// When this claim was last refreshed.
    pub last_refresh: DateTime<Utc>,
}

/// Holders split by file-type category, per `QueryHolders`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolderSets {
    /// Holders that serve the layer from an integrity-guaranteed static file.
    pub static_holders: Vec<Holder>,
    /// Holders that serve the layer from the local containerd content store.
    pub oci_holders: Vec<Holder>,
}

const CREATE_SCHEMA_SQL: &str = "CREATE SCHEMA IF NOT EXISTS accelerboat_cache";

const CREATE_TABLE_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS accelerboat_cache.cache_entries (
        digest TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        file_type TEXT NOT NULL,
        local_path TEXT NOT NULL,
        last_refresh TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (digest, endpoint, file_type)
    )
";

const CREATE_INDEX_SQL: &str = r"
    CREATE INDEX IF NOT EXISTS cache_entries_digest_idx
    ON accelerboat_cache.cache_entries (digest, last_refresh DESC)
";

const UPSERT_ENTRY_SQL: &str = r"
    INSERT INTO accelerboat_cache.cache_entries (digest, endpoint, file_type, local_path, last_refresh)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (digest, endpoint, file_type) DO UPDATE
    SET local_path = EXCLUDED.local_path, last_refresh = EXCLUDED.last_refresh
";

const DELETE_LAYER_SQL: &str = r"
    DELETE FROM accelerboat_cache.cache_entries
    WHERE digest = $1 AND endpoint = $2 AND file_type = $3
";

const DELETE_LOCATED_SQL: &str = r"
    DELETE FROM accelerboat_cache.cache_entries
    WHERE endpoint = $1 AND digest = $2
";

const SELECT_HOLDERS_SQL: &str = r"
    SELECT endpoint, file_type, local_path, last_refresh
    FROM accelerboat_cache.cache_entries
    WHERE digest = $1 AND last_refresh >= $2
    ORDER BY last_refresh DESC
";

/// Database-backed implementation of the Cluster Cache Index (spec §4.1).
pub struct CacheIndex {
    pool: PgPool,
    /// Endpoint string (`ip:port`) identifying this process among nodes.
    self_endpoint: String,
    /// Digests this process has written, used by `CleanHostCache`.
    written_digests: Mutex<HashSet<String>>,
}

impl CacheIndex {
    /// Opens the index against `pool`, creating the schema if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created or the connection
    /// pool is unreachable.
    pub async fn new(pool: PgPool, self_endpoint: impl Into<String>) -> Result<Self> {
        sqlx::query(CREATE_SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to create cache index schema")?;
        sqlx::query(CREATE_TABLE_SQL)
            .execute(&pool)
            .await
            .context("failed to create cache_entries table")?;
        sqlx::query(CREATE_INDEX_SQL)
            .execute(&pool)
            .await
            .context("failed to create cache_entries index")?;

        Ok(Self {
            pool,
            self_endpoint: self_endpoint.into(),
            written_digests: Mutex::new(HashSet::new()),
        })
    }

    /// `SaveLayer`: upsert this node's claim on `digest`, starting its
    /// freshness window. Tracks `digest` locally for `CleanHostCache`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn save_layer(
        &self,
        digest: &str,
        file_type: FileType,
        local_path: &str,
    ) -> Result<()> {
        sqlx::query(UPSERT_ENTRY_SQL)
            .bind(digest)
            .bind(&self.self_endpoint)
            .bind(file_type.as_sql())
            .bind(local_path)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to save cache entry")?;

        self.lock_written().insert(digest.to_string());
        Ok(())
    }

    /// `DeleteLayer`: field-level delete of this node's claim on `digest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_layer(&self, digest: &str, file_type: FileType) -> Result<()> {
        sqlx::query(DELETE_LAYER_SQL)
            .bind(digest)
            .bind(&self.self_endpoint)
            .bind(file_type.as_sql())
            .execute(&self.pool)
            .await
            .context("failed to delete cache entry")?;
        Ok(())
    }

    /// `DeleteLocated`: deletes every field recorded for `node` on `digest`.
    /// Used by the coordinator when a probe reveals a stale holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_located(&self, node: &str, digest: &str) -> Result<()> {
        sqlx::query(DELETE_LOCATED_SQL)
            .bind(node)
            .bind(digest)
            .execute(&self.pool)
            .await
            .context("failed to delete located cache entries")?;
        Ok(())
    }

    /// `QueryHolders`: reads fresh claims for `digest`, splits by file-type
    /// category, sorts each newest-first, and caps each list at
    /// [`HOLDER_CAP`] even when more valid entries exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn query_holders(&self, digest: &str) -> Result<HolderSets> {
        let cutoff = Utc::now() - chrono::Duration::from_std(FRESHNESS_WINDOW).unwrap_or_default();
        let rows = sqlx::query(SELECT_HOLDERS_SQL)
            .bind(digest)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .context("failed to query cache holders")?;

        let mut sets = HolderSets::default();
        for row in rows {
            let endpoint: String = row.try_get("endpoint")?;
            let file_type_raw: String = row.try_get("file_type")?;
            let local_path: String = row.try_get("local_path")?;
            let last_refresh: DateTime<Utc> = row.try_get("last_refresh")?;

            let Some(file_type) = FileType::from_sql(&file_type_raw) else {
                warn!(file_type = %file_type_raw, "ignoring cache entry with unknown file type");
                continue;
            };
            let holder = Holder {
                endpoint,
                local_path,
                last_refresh,
            };
            match file_type {
                FileType::Static => {
                    if sets.static_holders.len() < HOLDER_CAP {
                        sets.static_holders.push(holder);
                    }
                }
                FileType::Containerd => {
                    if sets.oci_holders.len() < HOLDER_CAP {
                        sets.oci_holders.push(holder);
                    }
                }
                FileType::Dockerd => {}
            }
        }

        Ok(sets)
    }

    /// `CleanHostCache`: deletes every field this process has written, in
    /// parallel, then clears the local write set.
    ///
    /// # Errors
    ///
    /// Returns an error if any deletion fails. Already-cleaned entries are
    /// left out of the local set even when a later entry fails, since the
    /// set is only advisory bookkeeping.
    pub async fn clean_host_cache(&self) -> Result<()> {
        let digests: Vec<String> = self.lock_written().iter().cloned().collect();

        let deletions = digests
            .iter()
            .map(|digest| self.delete_located(&self.self_endpoint, digest));
        let results = futures_util::future::join_all(deletions).await;
        for result in results {
            result.context("failed to clean host cache entry")?;
        }

        self.lock_written().clear();
        Ok(())
    }

    fn lock_written(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.written_digests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("cache index written-digest set mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_sql_round_trips() {
        for file_type in [FileType::Static, FileType::Containerd, FileType::Dockerd] {
            let sql = file_type.as_sql();
            assert_eq!(FileType::from_sql(sql), Some(file_type));
        }
        assert_eq!(FileType::from_sql("bogus"), None);
    }
}
