//! Deterministic relay node selection
//!
//! Both sides of a pairing must be able to find each other's relay without
//! coordination, so selection is a pure function of public key material:
//! the candidate minimizing the 256-bit distance between the target hash
//! and the hash of `candidate ‖ nonce` wins. Reachability probing and the
//! cached home relay live on top of that.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::base_url;
use crate::crypto::generic_hash;
use crate::http::HttpClient;
use crate::store::{SettingsStore, StoreError};

/// The single default node everyone used before hash-based selection.
/// Removed from the candidate list, kept here for the migration.
pub const LEGACY_DEFAULT_NODE: &str = "relay.peerlink.network";

/// The candidate set that shipped alongside the legacy default. The
/// migration only applies to installations still on this stock set.
const HISTORICAL_DEFAULT_NODES: [&str; 3] = [
    "sync-1.peerlink.network",
    "sync-2.peerlink.network",
    "sync-3.peerlink.network",
];

const LEGACY_NODE_MIGRATION: &str = "2025-01-legacy-default-node";

#[derive(Debug, Clone, Error)]
pub enum SelectorError {
    #[error("no relay candidates configured")]
    NoCandidates,
    #[error("no reachable relay among {0} candidates")]
    NoReachableRelay(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pick the candidate minimizing `|target_hash - hash(candidate ‖ nonce)|`
/// over 256-bit big-endian integers. Pure and deterministic; ties resolve
/// to the earliest candidate.
pub fn select_node<'a>(
    candidates: &'a [String],
    target_hash: &[u8; 32],
    nonce: &[u8],
) -> Option<&'a str> {
    let mut best: Option<(&'a str, [u8; 32])> = None;
    for candidate in candidates {
        let candidate_hash = address_hash(candidate, nonce);
        let score = distance(target_hash, &candidate_hash);
        match &best {
            Some((_, current)) if *current <= score => {}
            _ => best = Some((candidate, score)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

/// Relay nodes to fan a message out to for one recipient: the home relay
/// recomputed under nonces `0..replication_count`. Duplicates are kept —
/// each nonce is its own delivery slot.
pub fn recipient_nodes(
    candidates: &[String],
    recipient_hash: &[u8; 32],
    replication_count: u8,
) -> Vec<String> {
    (0..replication_count)
        .filter_map(|nonce| select_node(candidates, recipient_hash, &[nonce]))
        .map(str::to_string)
        .collect()
}

fn address_hash(candidate: &str, nonce: &[u8]) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(candidate.len() + nonce.len());
    preimage.extend_from_slice(candidate.as_bytes());
    preimage.extend_from_slice(nonce);
    let digest = generic_hash(&preimage, 32);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// |a - b| over 256-bit big-endian integers
fn distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    // Equal-length big-endian magnitudes compare lexicographically
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    let mut out = [0u8; 32];
    let mut borrow = 0u16;
    for i in (0..32).rev() {
        let minuend = hi[i] as i32;
        let subtrahend = lo[i] as i32 + borrow as i32;
        if minuend < subtrahend {
            out[i] = (minuend + 256 - subtrahend) as u8;
            borrow = 1;
        } else {
            out[i] = (minuend - subtrahend) as u8;
            borrow = 0;
        }
    }
    out
}

/// Home-relay resolution and recipient-relay recomputation over a candidate
/// list, with reachability probing and a store-backed cache
pub struct RelayNodeSelector {
    http: Arc<dyn HttpClient>,
    store: Arc<dyn SettingsStore>,
}

impl RelayNodeSelector {
    pub fn new(http: Arc<dyn HttpClient>, store: Arc<dyn SettingsStore>) -> Self {
        Self { http, store }
    }

    /// The stable home relay for this identity: cached once the first
    /// reachable candidate is confirmed.
    ///
    /// The probe order walks `select_node(own_hash, nonce)` for nonce
    /// 0, 1, 2, ... — the same ladder senders recompute with the recipient's
    /// hash, so replicated sends cover exactly the nodes this party may have
    /// fallen back to. Candidates the ladder never surfaces are probed last,
    /// starting at `own_hash % len` so clients spread instead of herding
    /// onto the first entry.
    pub async fn resolve_home_relay(
        &self,
        identity_hash: &[u8; 32],
        candidates: &[String],
    ) -> Result<String, SelectorError> {
        if candidates.is_empty() {
            return Err(SelectorError::NoCandidates);
        }

        if let Some(cached) = self.store.relay_server().await? {
            return Ok(cached);
        }

        self.migrate_legacy_default(candidates).await?;
        if let Some(cached) = self.store.relay_server().await? {
            return Ok(cached);
        }

        for candidate in probe_order(identity_hash, candidates) {
            if self.is_node_reachable(&candidate).await {
                info!(node = %candidate, "home relay selected");
                self.store.set_relay_server(&candidate).await?;
                return Ok(candidate);
            }
            debug!(node = %candidate, "relay candidate unreachable, trying next");
        }

        Err(SelectorError::NoReachableRelay(candidates.len()))
    }

    /// A node is reachable when any HTTP response comes back at all; an
    /// unauthenticated 401 still proves the node is alive.
    pub async fn is_node_reachable(&self, node: &str) -> bool {
        match self
            .http
            .get(&base_url(node), super::api::SYNC_PATH, &[], &[], Some(5_000))
            .await
        {
            Ok(_) => true,
            Err(error) => !error.is_connectivity(),
        }
    }

    /// One-time migration for installations that relied on the now-removed
    /// legacy default node. Skipped once a relay is already cached, once
    /// the candidate list differs from the historical default set, or on a
    /// fresh installation with no peers.
    async fn migrate_legacy_default(&self, candidates: &[String]) -> Result<(), SelectorError> {
        let mut completed = self.store.completed_migrations().await?;
        if completed.iter().any(|name| name == LEGACY_NODE_MIGRATION) {
            return Ok(());
        }

        let stock_set = candidates.len() == HISTORICAL_DEFAULT_NODES.len()
            && candidates
                .iter()
                .all(|candidate| HISTORICAL_DEFAULT_NODES.contains(&candidate.as_str()));
        let has_peers = !self.store.peers().await?.is_empty();

        if stock_set && has_peers {
            if self.is_node_reachable(LEGACY_DEFAULT_NODE).await {
                info!(node = LEGACY_DEFAULT_NODE, "pinning legacy default relay");
                self.store.set_relay_server(LEGACY_DEFAULT_NODE).await?;
            } else {
                warn!(
                    node = LEGACY_DEFAULT_NODE,
                    "legacy default relay unreachable, re-homing"
                );
            }
        }

        completed.push(LEGACY_NODE_MIGRATION.to_string());
        self.store.set_completed_migrations(&completed).await?;
        Ok(())
    }
}

/// Deterministic probe order for one identity: the replication nonce
/// ladder first, then any candidates the ladder never reached, rotated by
/// `own_hash % len`.
fn probe_order(identity_hash: &[u8; 32], candidates: &[String]) -> Vec<String> {
    let mut order: Vec<String> = Vec::with_capacity(candidates.len());

    for nonce in 0..=u8::MAX {
        if order.len() == candidates.len() {
            return order;
        }
        if nonce as usize >= candidates.len() * 4 {
            break;
        }
        if let Some(candidate) = select_node(candidates, identity_hash, &[nonce]) {
            if !order.iter().any(|seen| seen == candidate) {
                order.push(candidate.to_string());
            }
        }
    }

    let start = start_index(identity_hash, candidates.len());
    for offset in 0..candidates.len() {
        let candidate = &candidates[(start + offset) % candidates.len()];
        if !order.iter().any(|seen| seen == candidate) {
            order.push(candidate.clone());
        }
    }
    order
}

fn start_index(identity_hash: &[u8; 32], len: usize) -> usize {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&identity_hash[..8]);
    (u64::from_be_bytes(prefix) % len as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpError;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn candidates() -> Vec<String> {
        vec!["n1".to_string(), "n2".to_string(), "n3".to_string()]
    }

    #[test]
    fn test_select_node_deterministic() {
        let nodes = candidates();
        let target = address_hash("some recipient", &[]);

        let first = select_node(&nodes, &target, &[0]).unwrap();
        for _ in 0..10 {
            assert_eq!(select_node(&nodes, &target, &[0]).unwrap(), first);
        }
    }

    #[test]
    fn test_select_node_minimizes_distance() {
        let nodes = candidates();
        let target = address_hash("another recipient", &[]);
        let chosen = select_node(&nodes, &target, &[1]).unwrap();

        let chosen_score = distance(&target, &address_hash(chosen, &[1]));
        for node in &nodes {
            let score = distance(&target, &address_hash(node, &[1]));
            assert!(chosen_score <= score);
        }
    }

    #[test]
    fn test_select_node_empty_candidates() {
        let target = [0u8; 32];
        assert!(select_node(&[], &target, &[]).is_none());
    }

    #[test]
    fn test_distance_properties() {
        let a = address_hash("a", &[]);
        let b = address_hash("b", &[]);
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert_eq!(distance(&a, &a), [0u8; 32]);
    }

    #[test]
    fn test_distance_small_values() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[31] = 5;
        b[30] = 1; // 256
        let expected = {
            let mut e = [0u8; 32];
            e[31] = 251; // 256 - 5
            e
        };
        assert_eq!(distance(&a, &b), expected);
    }

    #[test]
    fn test_replication_slots_are_deterministic() {
        let nodes = candidates();
        let target = address_hash("recipient pk", &[]);

        let first = recipient_nodes(&nodes, &target, 2);
        let second = recipient_nodes(&nodes, &target, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    proptest! {
        #[test]
        fn prop_select_node_pure_and_minimal(
            seed in "[a-z]{1,12}",
            nonce in 0u8..8,
            count in 1usize..6,
        ) {
            let nodes: Vec<String> = (0..count).map(|i| format!("node-{i}.example")).collect();
            let target = address_hash(&seed, &[]);

            let first = select_node(&nodes, &target, &[nonce]).unwrap().to_string();
            let second = select_node(&nodes, &target, &[nonce]).unwrap().to_string();
            prop_assert_eq!(&first, &second);

            let chosen_score = distance(&target, &address_hash(&first, &[nonce]));
            for node in &nodes {
                let score = distance(&target, &address_hash(node, &[nonce]));
                prop_assert!(chosen_score <= score);
            }
        }
    }

    struct ProbeHttp {
        reachable: HashSet<String>,
        calls: AtomicUsize,
    }

    impl ProbeHttp {
        fn new(reachable: &[&str]) -> Self {
            Self {
                reachable: reachable.iter().map(|node| node.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpClient for ProbeHttp {
        async fn get(
            &self,
            url: &str,
            _path: &str,
            _headers: &[(String, String)],
            _params: &[(String, String)],
            _timeout_ms: Option<u64>,
        ) -> Result<String, HttpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .reachable
                .iter()
                .any(|node| url.contains(node.as_str()))
            {
                // A living node still rejects unauthenticated sync
                Err(HttpError::Status {
                    code: 401,
                    body: "{}".to_string(),
                })
            } else {
                Err(HttpError::Network("connection refused".to_string()))
            }
        }

        async fn post(
            &self,
            _url: &str,
            _path: &str,
            _headers: &[(String, String)],
            _body: Option<String>,
            _timeout_ms: Option<u64>,
        ) -> Result<String, HttpError> {
            Err(HttpError::Network("unexpected".to_string()))
        }

        async fn put(
            &self,
            _url: &str,
            _path: &str,
            _headers: &[(String, String)],
            _body: Option<String>,
            _timeout_ms: Option<u64>,
        ) -> Result<String, HttpError> {
            Err(HttpError::Network("unexpected".to_string()))
        }
    }

    #[test]
    fn test_probe_order_covers_all_candidates() {
        let nodes = candidates();
        let identity = address_hash("me", &[]);

        let order = probe_order(&identity, &nodes);
        assert_eq!(order.len(), nodes.len());
        for node in &nodes {
            assert!(order.contains(node));
        }
        // The ladder head is what senders recompute with nonce 0
        assert_eq!(order[0], select_node(&nodes, &identity, &[0]).unwrap());
    }

    #[tokio::test]
    async fn test_home_matches_sender_recomputation_when_reachable() {
        let http = Arc::new(ProbeHttp::new(&["n1", "n2", "n3"]));
        let store = Arc::new(crate::store::BackendSettingsStore::memory());
        let selector = RelayNodeSelector::new(http, store);

        let identity = address_hash("wallet identity", &[]);
        let nodes = candidates();

        let home = selector.resolve_home_relay(&identity, &nodes).await.unwrap();
        // A sender recomputing this identity's relay under nonce 0 lands on
        // the same node
        assert_eq!(recipient_nodes(&nodes, &identity, 1), vec![home]);
    }

    #[tokio::test]
    async fn test_home_relay_cached_after_first_resolution() {
        let http = Arc::new(ProbeHttp::new(&["n1", "n2", "n3"]));
        let store = Arc::new(crate::store::BackendSettingsStore::memory());
        let selector = RelayNodeSelector::new(http.clone(), store.clone());

        let identity = address_hash("me", &[]);
        let nodes = candidates();

        let first = selector.resolve_home_relay(&identity, &nodes).await.unwrap();
        let probes_after_first = http.calls.load(Ordering::SeqCst);

        let second = selector.resolve_home_relay(&identity, &nodes).await.unwrap();
        assert_eq!(first, second);
        // Cached: no further probing
        assert_eq!(http.calls.load(Ordering::SeqCst), probes_after_first);
    }

    #[tokio::test]
    async fn test_all_candidates_unreachable() {
        let http = Arc::new(ProbeHttp::new(&[]));
        let store = Arc::new(crate::store::BackendSettingsStore::memory());
        let selector = RelayNodeSelector::new(http, store);

        let identity = address_hash("me", &[]);
        let result = selector.resolve_home_relay(&identity, &candidates()).await;
        assert!(matches!(result, Err(SelectorError::NoReachableRelay(3))));
    }

    #[tokio::test]
    async fn test_probe_order_spreads_by_identity() {
        // Only n3 reachable: whatever the start index, the walk finds it
        let http = Arc::new(ProbeHttp::new(&["n3"]));
        let store = Arc::new(crate::store::BackendSettingsStore::memory());
        let selector = RelayNodeSelector::new(http, store);

        let identity = address_hash("someone", &[]);
        let chosen = selector
            .resolve_home_relay(&identity, &candidates())
            .await
            .unwrap();
        assert_eq!(chosen, "n3");
    }
}
