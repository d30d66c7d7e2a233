//! Peer registry: the live set of a server's connections.
//!
//! [`PeerRegistry`] is a cheap-to-clone handle on a map from peer id to
//! [`Peer`]. A peer is present from the moment it is admitted until its
//! connection closes or the server shuts down.

use crate::server::{Peer, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe set of connected peers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerId, Peer>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a newly admitted peer.
    pub fn add(&self, peer: Peer) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(peer.id(), peer);
    }

    /// Remove a peer. Returns it if it was still present.
    pub fn remove(&self, id: PeerId) -> Option<Peer> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(&id)
    }

    /// Look up a live peer by id.
    pub fn get(&self, id: PeerId) -> Option<Peer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(&id).cloned()
    }

    /// Whether `id` is in the live set.
    pub fn contains(&self, id: PeerId) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(&id)
    }

    /// All current peers, oldest connection first.
    pub fn snapshot(&self) -> Vec<Peer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Peer> = peers.values().cloned().collect();
        list.sort_by_key(|p| p.connected_at());
        list
    }

    /// Remove and return every peer.
    pub fn drain(&self) -> Vec<Peer> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.drain().map(|(_, peer)| peer).collect()
    }

    /// Number of live peers.
    pub fn count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::connection;
    use crate::handlers::Handlers;
    use crate::memory;
    use crate::protocol::Protocol;
    use crate::transport::Transport;

    fn make_peer() -> (Peer, Transport) {
        let (ours, theirs) = memory::duplex();
        let info = ours.info.clone();
        let (protocol, outbox) =
            Protocol::new(Arc::new(JsonCodec), Arc::new(Handlers::new()), None);
        let handle = connection::spawn(protocol, outbox, ours);
        (Peer::new(info, handle), theirs)
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = PeerRegistry::new();
        let (peer, _remote) = make_peer();
        let id = peer.id();

        registry.add(peer);
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(id));
        assert_eq!(registry.get(id).map(|p| p.id()), Some(id));

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_and_drain() {
        let registry = PeerRegistry::new();
        let (a, _ra) = make_peer();
        let (b, _rb) = make_peer();
        registry.add(a.clone());
        registry.add(b.clone());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&a) && snapshot.contains(&b));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let registry = PeerRegistry::new();
        let view = registry.clone();
        let (peer, _remote) = make_peer();
        registry.add(peer);
        assert_eq!(view.count(), 1);
    }
}
