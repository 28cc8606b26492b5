//! Peer presence tracking.
//!
//! Peers mirror live radio presence: created on discovery, refreshed on
//! every frame or heartbeat, evicted after a quiet period. Nothing here is
//! persisted across restarts.

use emberlink_core::Peer;
use std::collections::HashMap;

/// Outcome of recording a peer sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    /// First sighting of this peer
    Appeared,
    /// Known peer refreshed
    Updated,
}

/// In-memory registry of peers sighted on one transport.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
    quiet_period_ms: u64,
    max_peers: usize,
}

impl PeerRegistry {
    /// Maximum peers tracked before the stalest is evicted.
    pub const DEFAULT_MAX_PEERS: usize = 128;

    /// Create a registry evicting peers unheard for `quiet_period_ms`.
    pub fn new(quiet_period_ms: u64) -> Self {
        Self {
            peers: HashMap::new(),
            quiet_period_ms,
            max_peers: Self::DEFAULT_MAX_PEERS,
        }
    }

    /// Record a sighting, inserting or refreshing the peer.
    pub fn upsert(&mut self, peer: Peer) -> PeerChange {
        if self.peers.len() >= self.max_peers && !self.peers.contains_key(&peer.id) {
            if let Some(stalest) = self.find_stalest() {
                self.peers.remove(&stalest);
            }
        }

        match self.peers.insert(peer.id.clone(), peer) {
            None => PeerChange::Appeared,
            Some(_) => PeerChange::Updated,
        }
    }

    /// Refresh a peer's last-seen timestamp without other changes.
    pub fn touch(&mut self, peer_id: &str, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen_ms = now_ms;
        }
    }

    /// Look up a peer by id.
    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Snapshot of all tracked peers.
    pub fn all(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    /// Number of peers currently tracked.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are in range.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Remove and return every peer quiet past the eviction window.
    pub fn evict_quiet(&mut self, now_ms: u64) -> Vec<Peer> {
        let quiet: Vec<String> = self
            .peers
            .values()
            .filter(|p| now_ms.saturating_sub(p.last_seen_ms) > self.quiet_period_ms)
            .map(|p| p.id.clone())
            .collect();

        quiet
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .collect()
    }

    fn find_stalest(&self) -> Option<String> {
        self.peers
            .values()
            .min_by_key(|p| p.last_seen_ms)
            .map(|p| p.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberlink_core::TransportClass;

    fn test_peer(id: &str, last_seen_ms: u64) -> Peer {
        Peer {
            id: id.to_string(),
            display_name: Some(format!("{id}-name")),
            handle: format!("handle-{id}"),
            transport: TransportClass::ShortRange,
            last_seen_ms,
            link_quality: 0.9,
        }
    }

    #[test]
    fn test_upsert_reports_appearance() {
        let mut registry = PeerRegistry::new(60_000);

        assert_eq!(registry.upsert(test_peer("p1", 1_000)), PeerChange::Appeared);
        assert_eq!(registry.upsert(test_peer("p1", 2_000)), PeerChange::Updated);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_quiet_peers_evicted() {
        let mut registry = PeerRegistry::new(30_000);
        registry.upsert(test_peer("fresh", 100_000));
        registry.upsert(test_peer("stale", 10_000));

        let evicted = registry.evict_quiet(100_000);

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "stale");
        assert!(registry.get("fresh").is_some());
    }

    #[test]
    fn test_touch_defers_eviction() {
        let mut registry = PeerRegistry::new(30_000);
        registry.upsert(test_peer("p1", 10_000));

        registry.touch("p1", 95_000);
        assert!(registry.evict_quiet(100_000).is_empty());
    }

    #[test]
    fn test_capacity_evicts_stalest() {
        let mut registry = PeerRegistry::new(60_000);
        registry.max_peers = 2;

        registry.upsert(test_peer("old", 1_000));
        registry.upsert(test_peer("mid", 2_000));
        registry.upsert(test_peer("new", 3_000));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("old").is_none());
        assert!(registry.get("new").is_some());
    }
}
