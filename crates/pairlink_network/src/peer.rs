//! Discovered-peer set: the devices currently visible on the LAN.

use crate::identity::{PeerDescriptor, PeerId};

/// Order-preserving set of discovered peers keyed by identity.
///
/// Peers keep the position of their first sighting so a UI list does not
/// reshuffle when a known peer re-announces.
#[derive(Debug, Default, Clone)]
pub struct DiscoveredPeers {
    peers: Vec<PeerDescriptor>,
}

impl DiscoveredPeers {
    /// Create an empty set.
    pub fn new() -> Self {
        Self { peers: Vec::new() }
    }

    /// Insert a peer. Returns `false` if a peer with the same id is already
    /// present (the stored descriptor is kept).
    pub fn insert(&mut self, peer: PeerDescriptor) -> bool {
        if self.contains(&peer.id) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    /// Remove a peer by ID.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerDescriptor> {
        let pos = self.peers.iter().position(|p| &p.id == peer_id)?;
        Some(self.peers.remove(pos))
    }

    /// Whether a peer with this id is present.
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.iter().any(|p| &p.id == peer_id)
    }

    /// Get a peer by ID.
    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerDescriptor> {
        self.peers.iter().find(|p| &p.id == peer_id)
    }

    /// First peer (in discovery order) with this display name.
    pub fn find_by_name(&self, display_name: &str) -> Option<&PeerDescriptor> {
        self.peers.iter().find(|p| p.display_name == display_name)
    }

    /// All peers in discovery order.
    pub fn list(&self) -> &[PeerDescriptor] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget every peer (session teardown).
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn peer(id: &str, name: &str) -> PeerDescriptor {
        PeerDescriptor::new(PeerId::from_string(id), name, Role::Responder)
    }

    #[test]
    fn test_insert_dedupes_by_identity() {
        let mut set = DiscoveredPeers::new();
        assert!(set.insert(peer("a", "Studio")));
        assert!(!set.insert(peer("a", "Studio (renamed)")));
        assert_eq!(set.len(), 1);
        assert_eq!(set.list()[0].display_name, "Studio");
    }

    #[test]
    fn test_same_display_name_different_devices() {
        let mut set = DiscoveredPeers::new();
        set.insert(peer("a", "MacBook"));
        set.insert(peer("b", "MacBook"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.find_by_name("MacBook").unwrap().id.as_str(), "a");
    }

    #[test]
    fn test_order_is_preserved() {
        let mut set = DiscoveredPeers::new();
        set.insert(peer("c", "third"));
        set.insert(peer("a", "first"));
        set.insert(peer("b", "second"));
        set.remove(&PeerId::from_string("a"));
        set.insert(peer("a", "first"));

        let ids: Vec<&str> = set.list().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_remove_and_lookup() {
        let mut set = DiscoveredPeers::new();
        set.insert(peer("a", "one"));
        assert!(set.get(&PeerId::from_string("a")).is_some());
        assert!(set.remove(&PeerId::from_string("a")).is_some());
        assert!(set.remove(&PeerId::from_string("a")).is_none());
        assert!(set.is_empty());
    }
}
