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
#![allow(clippy::multiple_crate_versions)]
#![allow(unexpected_cfgs)]

//! Core event bus for the AccelerBoat platform.
//!
//! The bus provides a typed event enum, sequential identifiers, and support for
//! replaying recent events when subscribers reconnect (e.g. SSE clients that
//! supply `Last-Event-ID`). Internally it uses `tokio::broadcast` with a bounded
//! buffer; when the channel overflows, the oldest events are dropped, matching
//! the desired backpressure behaviour.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};
use tracing::error;

/// Identifier assigned to each event emitted by the platform.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Normal/Warning classification recorded alongside every event.
///
/// Non-fatal errors are always recorded as `Warning`; successful operations
/// as `Normal`. `Fatal` errors are not events — they terminate the process.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// The operation completed as expected.
    Normal,
    /// The operation failed in a recoverable way.
    Warning,
}

/// Typed domain events surfaced across the system.
///
/// Each variant declares exactly the fields it carries; there is no
/// duck-typed details map, so every consumer of the event stream gets
/// compile-time checked access to the fields relevant to that event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A blob was served to the local runtime straight from disk.
    ServeBlobFromLocal {
        /// Layer digest served.
        digest: String,
        /// Repository the blob was requested under.
        repo: String,
        /// Size of the served blob in bytes.
        size_bytes: u64,
        /// Wall-clock time spent serving the blob.
        duration_ms: u64,
    },
    /// The node asked the coordinator for holder information on a blob.
    GetBlobFromMaster {
        /// Layer digest requested.
        digest: String,
        /// Repository the blob belongs to.
        repo: String,
        /// Endpoint of the coordinator that answered.
        coordinator: String,
        /// Wall-clock time spent on the round trip.
        duration_ms: u64,
    },
    /// A blob was fetched from a peer over plain TCP.
    DownloadBlobByTcp {
        /// Layer digest transferred.
        digest: String,
        /// Endpoint of the peer the bytes came from.
        holder: String,
        /// Size of the transferred blob in bytes.
        size_bytes: u64,
        /// Wall-clock time spent transferring.
        duration_ms: u64,
    },
    /// A blob was fetched from a peer over the BitTorrent transport.
    DownloadBlobByTorrent {
        /// Layer digest transferred.
        digest: String,
        /// Endpoint of the peer that originated the torrent.
        holder: String,
        /// Size of the transferred blob in bytes.
        size_bytes: u64,
        /// Wall-clock time spent transferring.
        duration_ms: u64,
    },
    /// A coordinator's probe against a purported holder failed.
    CacheProbeFailed {
        /// Layer digest being probed.
        digest: String,
        /// Endpoint of the holder that failed the probe.
        holder: String,
        /// File type recorded for the failed entry.
        file_type: String,
        /// Human-readable reason the probe failed.
        reason: String,
    },
    /// The coordinator assigned a download to a worker node.
    DistributionAssigned {
        /// Layer digest being distributed.
        digest: String,
        /// Endpoint of the worker chosen to perform the download.
        worker: String,
        /// 1-based attempt number for this digest.
        attempt: u32,
    },
    /// A BitTorrent transfer failed and the pipeline fell back to TCP.
    TorrentFailure {
        /// Layer digest that failed to transfer via torrent.
        digest: String,
        /// Reason the torrent transfer was abandoned.
        reason: String,
    },
    /// A cleanup sweep completed.
    CleanupSwept {
        /// Number of files deleted during the sweep.
        deleted_files: u64,
        /// Bytes reclaimed during the sweep.
        freed_bytes: u64,
        /// Total disk usage across cache directories after the sweep.
        total_usage_bytes: u64,
    },
    /// The elected coordinator changed.
    LeaderChanged {
        /// Endpoint now considered the coordinator.
        endpoint: String,
    },
    /// Configuration was reloaded from disk.
    ConfigReloaded {
        /// Monotonic revision assigned to the reloaded configuration.
        revision: u64,
    },
    /// System health status changed (degraded or restored components).
    HealthChanged {
        /// Components currently considered degraded.
        degraded: Vec<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator for SSE consumers and journal filters.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ServeBlobFromLocal { .. } => "serve_blob_from_local",
            Self::GetBlobFromMaster { .. } => "get_blob_from_master",
            Self::DownloadBlobByTcp { .. } => "download_blob_by_tcp",
            Self::DownloadBlobByTorrent { .. } => "download_blob_by_torrent",
            Self::CacheProbeFailed { .. } => "cache_probe_failed",
            Self::DistributionAssigned { .. } => "distribution_assigned",
            Self::TorrentFailure { .. } => "torrent_failure",
            Self::CleanupSwept { .. } => "cleanup_swept",
            Self::LeaderChanged { .. } => "leader_changed",
            Self::ConfigReloaded { .. } => "config_reloaded",
            Self::HealthChanged { .. } => "health_changed",
        }
    }

    /// Default `Normal`/`Warning` classification for this event's kind.
    ///
    /// Callers reporting a recoverable failure should still prefer
    /// [`EventBus::publish_with_status`] with an explicit `Warning`; this is
    /// the fallback used by [`EventBus::publish`].
    #[must_use]
    pub const fn default_status(&self) -> EventStatus {
        match self {
            Self::CacheProbeFailed { .. } | Self::TorrentFailure { .. } => EventStatus::Warning,
            Self::HealthChanged { degraded } if !degraded.is_empty() => EventStatus::Warning,
            _ => EventStatus::Normal,
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id,
/// emission timestamp, originating request, and normal/warning status —
/// the full shape of the `Event` entity from the data model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Identifier of the request that produced this event, if any.
    pub request_id: Option<String>,
    /// Normal/Warning classification for this event.
    pub status: EventStatus,
    /// Wrapped event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// The broadcast channel uses the same capacity as the in-memory replay
    /// buffer, ensuring dropped events impact both structures consistently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    ///
    /// Status is derived from [`Event::default_status`]. Use
    /// [`EventBus::publish_with_status`] to attach an explicit status or a
    /// request id.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn publish(&self, event: Event) -> EventId {
        let status = event.default_status();
        self.publish_with_status(event, status, None)
    }

    /// Publish a new event with an explicit status and originating request id.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn publish_with_status(
        &self,
        event: Event,
        status: EventStatus,
        request_id: Option<String>,
    ) -> EventId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            request_id,
            status,
            event,
        };

        {
            let mut buffer = self.lock_buffer();
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying any buffered events newer than `since_id`.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let buffer = self.lock_buffer();
            for item in buffer.iter() {
                if item.id > since {
                    backlog.push_back(item.clone());
                }
            }
        }

        let receiver = self.sender.subscribe();
        EventStream { backlog, receiver }
    }

    /// Return a snapshot of buffered events newer than the supplied identifier.
    ///
    /// This is useful for endpoints that need incremental views without
    /// establishing a long-lived subscription.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn backlog_since(&self, since_id: EventId) -> Vec<EventEnvelope> {
        let buffer = self.lock_buffer();
        buffer
            .iter()
            .filter(|item| item.id > since_id)
            .cloned()
            .collect()
    }

    /// Returns the last assigned identifier, if any events have been published.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.lock_buffer();
        buffer.back().map(|event| event.id)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("event buffer mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that yields events either from the replay backlog or from the
/// live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::task;
    use tokio::time::timeout;

    const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn event_kinds_cover_all_variants() {
        let events = [
            Event::ServeBlobFromLocal {
                digest: "sha256:aaa".to_string(),
                repo: "library/nginx".to_string(),
                size_bytes: 1_024,
                duration_ms: 3,
            },
            Event::GetBlobFromMaster {
                digest: "sha256:aaa".to_string(),
                repo: "library/nginx".to_string(),
                coordinator: "10.0.0.1:9000".to_string(),
                duration_ms: 12,
            },
            Event::DownloadBlobByTcp {
                digest: "sha256:aaa".to_string(),
                holder: "10.0.0.2:9000".to_string(),
                size_bytes: 4_096,
                duration_ms: 80,
            },
            Event::DownloadBlobByTorrent {
                digest: "sha256:aaa".to_string(),
                holder: "10.0.0.3:9000".to_string(),
                size_bytes: 4_096,
                duration_ms: 200,
            },
            Event::CacheProbeFailed {
                digest: "sha256:aaa".to_string(),
                holder: "10.0.0.4:9000".to_string(),
                file_type: "oci".to_string(),
                reason: "connection refused".to_string(),
            },
            Event::DistributionAssigned {
                digest: "sha256:aaa".to_string(),
                worker: "10.0.0.5:9000".to_string(),
                attempt: 1,
            },
            Event::TorrentFailure {
                digest: "sha256:aaa".to_string(),
                reason: "no peers connected".to_string(),
            },
            Event::CleanupSwept {
                deleted_files: 12,
                freed_bytes: 2_048,
                total_usage_bytes: 1_000_000,
            },
            Event::LeaderChanged {
                endpoint: "10.0.0.1:9000".to_string(),
            },
            Event::ConfigReloaded { revision: 7 },
            Event::HealthChanged {
                degraded: vec!["config".to_string()],
            },
        ];

        for event in events {
            let expected = match &event {
                Event::ServeBlobFromLocal { .. } => "serve_blob_from_local",
                Event::GetBlobFromMaster { .. } => "get_blob_from_master",
                Event::DownloadBlobByTcp { .. } => "download_blob_by_tcp",
                Event::DownloadBlobByTorrent { .. } => "download_blob_by_torrent",
                Event::CacheProbeFailed { .. } => "cache_probe_failed",
                Event::DistributionAssigned { .. } => "distribution_assigned",
                Event::TorrentFailure { .. } => "torrent_failure",
                Event::CleanupSwept { .. } => "cleanup_swept",
                Event::LeaderChanged { .. } => "leader_changed",
                Event::ConfigReloaded { .. } => "config_reloaded",
                Event::HealthChanged { .. } => "health_changed",
            };
            assert_eq!(event.kind(), expected);
        }
    }

    #[test]
    fn default_status_flags_failures_as_warning() {
        let probe_failed = Event::CacheProbeFailed {
            digest: "sha256:aaa".to_string(),
            holder: "10.0.0.4:9000".to_string(),
            file_type: "oci".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(probe_failed.default_status(), EventStatus::Warning);

        let served = Event::ServeBlobFromLocal {
            digest: "sha256:aaa".to_string(),
            repo: "library/nginx".to_string(),
            size_bytes: 1_024,
            duration_ms: 3,
        };
        assert_eq!(served.default_status(), EventStatus::Normal);

        let healthy = Event::HealthChanged { degraded: vec![] };
        assert_eq!(healthy.default_status(), EventStatus::Normal);
    }

    fn sample_progress_event(id: usize) -> Event {
        Event::DownloadBlobByTcp {
            digest: format!("sha256:{id:064x}"),
            holder: "10.0.0.2:9000".to_string(),
            size_bytes: (id * 1_000) as u64,
            duration_ms: 50,
        }
    }

    #[tokio::test]
    async fn sequential_ids_and_replay() {
        let bus = EventBus::with_capacity(16);

        let mut last_id = 0;
        for i in 0..5 {
            last_id = bus.publish(sample_progress_event(i));
        }
        assert_eq!(last_id, 5);

        let mut stream = bus.subscribe(Some(2));
        let mut received = Vec::new();
        for _ in 0..3 {
            if let Some(event) = stream.next().await {
                received.push(event);
            }
        }

        assert_eq!(received.len(), 3);
        assert_eq!(received.first().unwrap().id, 3);
        assert_eq!(received.last().unwrap().id, 5);
    }

    #[tokio::test]
    async fn load_test_does_not_stall_publishers() {
        let bus = Arc::new(EventBus::with_capacity(512));
        let mut stream = bus.subscribe(None);

        let publisher = {
            let bus = bus.clone();
            task::spawn(async move {
                for i in 0..500 {
                    let publish_bus = bus.clone();
                    timeout(PUBLISH_TIMEOUT, async move {
                        let _ = publish_bus.publish(sample_progress_event(i));
                    })
                    .await
                    .expect("publish timed out");
                }
            })
        };

        let consumer = task::spawn(async move {
            let mut ids = HashSet::new();
            while ids.len() < 500 {
                if let Some(event) = stream.next().await {
                    ids.insert(event.id);
                }
            }
            ids
        });

        publisher.await.expect("publisher task panicked");
        let ids = consumer.await.expect("consumer task panicked");
        assert_eq!(ids.len(), 500);
    }

    #[tokio::test]
    async fn last_event_id_reflects_recent_publish() {
        let bus = EventBus::with_capacity(2);
        assert!(bus.last_event_id().is_none(), "no events published yet");
        let published = bus.publish(sample_progress_event(0));
        assert_eq!(bus.last_event_id(), Some(published));
    }

    #[tokio::test]
    async fn subscribe_without_since_replays_all() {
        let bus = EventBus::with_capacity(4);
        for i in 0..3 {
            let _ = bus.publish(sample_progress_event(i));
        }
        let mut stream = bus.subscribe(Some(0));
        let mut collected = Vec::new();
        for expected_id in 1..=3 {
            collected.push(
                timeout(PUBLISH_TIMEOUT, stream.next())
                    .await
                    .expect("stream stalled")
                    .expect("stream closed"),
            );
            assert_eq!(collected.last().unwrap().id, expected_id);
        }
        assert_eq!(collected.len(), 3);
    }

    #[tokio::test]
    async fn stream_returns_none_after_sender_dropped() {
        let mut stream = {
            let bus = EventBus::with_capacity(1);
            let stream = bus.subscribe(None);
            drop(bus);
            stream
        };
        assert!(
            stream.next().await.is_none(),
            "closing the sender should end the stream"
        );
    }
}
