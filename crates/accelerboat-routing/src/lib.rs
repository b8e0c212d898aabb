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

//! Leader selection and least-busy distribution over the cluster's live node set.
//!
//! Two independent pieces live here: a deterministic, message-free leader
//! function ([`current_master`]) that every node can evaluate on its own
//! given the same inputs, and a least-connection scheduler
//! ([`NodeLoadTracker`]) used to pick a worker for a fresh download.
//!
//! The actual endpoint source (watching a Kubernetes `Endpoints` resource) is
//! an external collaborator; this crate only depends on the
//! [`EndpointSource`] trait, not on any particular watcher implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Backoff applied when the endpoint watch channel is lost.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Operator-supplied hints that bias leader selection.
#[derive(Debug, Clone, Default)]
pub struct LeaderPreference {
    /// Operator override: force this node to be considered, and let it win
    /// outright if it is present as `masterIP:<port>`.
    pub master_ip: Option<String>,
    /// IP addresses of nodes selected by the configured label selector.
    /// When non-empty, the candidate set is narrowed to their intersection
    /// with the live endpoint set.
    pub preferred_ips: HashSet<String>,
}

/// Computes the weighted-ASCII score `sum(i + byte[i])` for an endpoint string.
///
/// Kept intentionally naive: this is not a hash function, it is the literal
/// scoring rule the algorithm is specified against.
#[must_use]
fn weighted_ascii_score(endpoint: &str) -> u64 {
    endpoint
        .bytes()
        .enumerate()
        .map(|(i, byte)| i as u64 + u64::from(byte))
        .sum()
}

/// Derives the current coordinator endpoint from the live endpoint set and an
/// operator preference, per the weighted-ASCII leader algorithm.
///
/// Deterministic: the same `endpoints` and `preference` always yield the
/// same result regardless of call order or endpoint ordering. Returns `None`
/// when `endpoints` is empty.
#[must_use]
pub fn current_master(endpoints: &[String], preference: &LeaderPreference) -> Option<String> {
    if endpoints.is_empty() {
        return None;
    }

    let mut candidates: Vec<&String> = if preference.preferred_ips.is_empty() {
        endpoints.iter().collect()
    } else {
        let preferred: Vec<&String> = endpoints
            .iter()
            .filter(|endpoint| {
                let ip = endpoint.split(':').next().unwrap_or(endpoint.as_str());
                preference.preferred_ips.contains(ip)
            })
            .collect();
        if preferred.is_empty() {
            endpoints.iter().collect()
        } else {
            preferred
        }
    };

    if let Some(master_ip) = preference.master_ip.as_deref() {
        if let Some(forced) = endpoints.iter().find(|endpoint| {
            endpoint.as_str() == master_ip || endpoint.starts_with(&format!("{master_ip}:"))
        }) {
            if !candidates.iter().any(|candidate| *candidate == forced) {
                candidates.push(forced);
            }
            let prefix = format!("{master_ip}:");
            if let Some(outright) = candidates
                .iter()
                .find(|candidate| candidate.starts_with(&prefix))
            {
                return Some((*outright).clone());
            }
        }
    }

    candidates
        .into_iter()
        .max_by(|a, b| {
            weighted_ascii_score(a)
                .cmp(&weighted_ascii_score(b))
                .then_with(|| a.cmp(b))
        })
        .cloned()
}

/// External collaborator abstraction over the live node list.
///
/// Implemented elsewhere (typically backed by a Kubernetes `Endpoints`
/// watcher); this crate only consumes snapshots and a change-notification
/// channel.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Returns the current set of live node endpoints.
    async fn snapshot(&self) -> Vec<String>;

    /// Subscribes to endpoint-set changes. The receiver yields the latest
    /// snapshot whenever the underlying watch observes an add/modify/delete
    /// event.
    fn subscribe(&self) -> watch::Receiver<Vec<String>>;
}

/// Maintains the cluster's current coordinator decision.
///
/// A transient empty endpoint set (e.g. a momentary watcher reconnect)
/// leaves the previous decision in place rather than clearing it, matching
/// the "degrades gracefully on endpoint churn" property.
pub struct LeaderSelector {
    preference: LeaderPreference,
    current: Mutex<Option<String>>,
}

impl LeaderSelector {
    /// Builds a selector with the given preference and no decision yet.
    #[must_use]
    pub fn new(preference: LeaderPreference) -> Self {
        Self {
            preference,
            current: Mutex::new(None),
        }
    }

    /// Returns the most recently computed coordinator, if any.
    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.lock_current().clone()
    }

    /// Recomputes the coordinator from a freshly observed endpoint set.
    ///
    /// An empty `endpoints` is ignored, preserving the previous decision.
    pub fn observe(&self, endpoints: &[String]) -> Option<String> {
        if endpoints.is_empty() {
            debug!("endpoint set empty, keeping previous leader decision");
            return self.current();
        }
        let decision = current_master(endpoints, &self.preference);
        *self.lock_current() = decision.clone();
        decision
    }

    /// Runs the watch loop against an [`EndpointSource`] until its channel
    /// closes permanently. Reconnects with [`RECONNECT_BACKOFF`] whenever the
    /// channel is dropped, per the failure model in the spec.
    pub async fn run(&self, source: &dyn EndpointSource) {
        self.observe(&source.snapshot().await);

        loop {
            let mut receiver = source.subscribe();
            loop {
                match receiver.changed().await {
                    Ok(()) => {
                        let endpoints = receiver.borrow().clone();
                        self.observe(&endpoints);
                    }
                    Err(_closed) => {
                        warn!("endpoint watch channel closed, reconnecting");
                        break;
                    }
                }
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("leader selector mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

/// Least-connection scheduler used by `DistributeNode`/`ReleaseNode`.
///
/// Keeps an in-memory `endpoint -> active task count` map, reconciled
/// against the live endpoint set on every call so departed nodes stop being
/// selected and newly joined nodes start at zero load.
#[derive(Default)]
pub struct NodeLoadTracker {
    load: Mutex<HashMap<String, u32>>,
}

impl NodeLoadTracker {
    /// Builds an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciles the load map with the current endpoint set, selects the
    /// endpoint with the minimum active task count, increments it, and
    /// returns it. Returns `None` if `live` is empty.
    pub fn distribute_node(&self, live: &[String]) -> Option<String> {
        let mut load = self.lock_load();
        reconcile(&mut load, live);

        let chosen = load
            .iter()
            .min_by_key(|(endpoint, count)| (**count, (*endpoint).clone()))
            .map(|(endpoint, _)| endpoint.clone())?;
        *load.get_mut(&chosen).expect("just selected") += 1;
        Some(chosen)
    }

    /// Decrements the active task count for `endpoint`, floored at zero.
    pub fn release_node(&self, endpoint: &str) {
        let mut load = self.lock_load();
        if let Some(count) = load.get_mut(endpoint) {
            *count = count.saturating_sub(1);
        }
    }

    /// Returns the current active task count for `endpoint`, if tracked.
    #[must_use]
    pub fn load_of(&self, endpoint: &str) -> Option<u32> {
        self.lock_load().get(endpoint).copied()
    }

    fn lock_load(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        match self.load.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("node load tracker mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

fn reconcile(load: &mut HashMap<String, u32>, live: &[String]) {
    let live_set: HashSet<&String> = live.iter().collect();
    load.retain(|endpoint, _| live_set.contains(endpoint));
    for endpoint in live {
        load.entry(endpoint.clone()).or_insert(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_endpoint_wins_by_default() {
        let endpoints = vec!["10.0.0.2:9000".to_string()];
        let decision = current_master(&endpoints, &LeaderPreference::default());
        assert_eq!(decision.as_deref(), Some("10.0.0.2:9000"));
    }

    #[test]
    fn empty_endpoint_set_yields_none() {
        assert_eq!(current_master(&[], &LeaderPreference::default()), None);
    }

    #[test]
    fn leader_election_is_order_independent() {
        let endpoints = vec![
            "10.0.0.2:9000".to_string(),
            "10.0.0.3:9000".to_string(),
            "10.0.0.10:9000".to_string(),
        ];
        let mut reordered = endpoints.clone();
        reordered.reverse();

        let a = current_master(&endpoints, &LeaderPreference::default());
        let b = current_master(&reordered, &LeaderPreference::default());
        assert_eq!(a, b);
        assert_eq!(a.as_deref(), Some("10.0.0.10:9000"));
    }

    #[test]
    fn master_ip_prefix_wins_outright() {
        let endpoints = vec!["10.0.0.2:9000".to_string(), "10.0.0.99:9000".to_string()];
        let preference = LeaderPreference {
            master_ip: Some("10.0.0.2".to_string()),
            preferred_ips: HashSet::new(),
        };
        assert_eq!(
            current_master(&endpoints, &preference).as_deref(),
            Some("10.0.0.2:9000")
        );
    }

    #[test]
    fn preferred_subset_narrows_candidates() {
        let endpoints = vec![
            "10.0.0.2:9000".to_string(),
            "10.0.0.3:9000".to_string(),
            "10.0.0.10:9000".to_string(),
        ];
        let mut preferred_ips = HashSet::new();
        preferred_ips.insert("10.0.0.2".to_string());
        preferred_ips.insert("10.0.0.3".to_string());
        let preference = LeaderPreference {
            master_ip: None,
            preferred_ips,
        };
        assert_eq!(
            current_master(&endpoints, &preference).as_deref(),
            Some("10.0.0.3:9000")
        );
    }

    #[test]
    fn leader_selector_ignores_transient_empty_set() {
        let selector = LeaderSelector::new(LeaderPreference::default());
        selector.observe(&["10.0.0.2:9000".to_string()]);
        assert_eq!(selector.current().as_deref(), Some("10.0.0.2:9000"));
        selector.observe(&[]);
        assert_eq!(selector.current().as_deref(), Some("10.0.0.2:9000"));
    }

    #[test]
    fn distribute_then_release_restores_counter() {
        let tracker = NodeLoadTracker::new();
        let live = vec!["a:9000".to_string(), "b:9000".to_string()];
        let picked = tracker.distribute_node(&live).expect("non-empty set");
        assert_eq!(tracker.load_of(&picked), Some(1));
        tracker.release_node(&picked);
        assert_eq!(tracker.load_of(&picked), Some(0));
    }

    #[test]
    fn least_busy_endpoint_is_selected() {
        let tracker = NodeLoadTracker::new();
        let live = vec!["a:9000".to_string(), "b:9000".to_string()];
        let first = tracker.distribute_node(&live).unwrap();
        let second = tracker.distribute_node(&live).unwrap();
        assert_ne!(first, second, "load should spread across both nodes");
    }

    #[test]
    fn departed_nodes_are_forgotten() {
        let tracker = NodeLoadTracker::new();
        tracker.distribute_node(&["a:9000".to_string(), "b:9000".to_string()]);
        let reconciled = tracker.distribute_node(&["b:9000".to_string()]);
        assert_eq!(reconciled.as_deref(), Some("b:9000"));
    }
}
