//! Connection registry for peer and document membership tracking.
//!
//! The registry maintains bidirectional mappings: document → peers and
//! peer → documents (for cleanup on disconnect). Both directions are O(1).
//!
//! Sessions hold the authoritative member set used for broadcast. The registry
//! mirrors it per peer so a closed connection can be dropped from every session
//! it joined without scanning all sessions.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

/// Opaque connection identity, unique for the lifetime of the process.
pub type PeerId = u64;

/// Information about a registered peer.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Remote address, when the transport has one
    pub remote_addr: Option<SocketAddr>,
}

impl PeerInfo {
    /// Peer info with a known remote address.
    pub fn with_addr(remote_addr: SocketAddr) -> Self {
        Self { remote_addr: Some(remote_addr) }
    }
}

/// Registry for tracking peers and the documents they have joined.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Peer ID → peer info
    peers: HashMap<PeerId, PeerInfo>,
    /// Document name → joined peers
    document_peers: HashMap<String, HashSet<PeerId>>,
    /// Peer ID → joined document names
    peer_documents: HashMap<PeerId, HashSet<String>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new peer.
    ///
    /// Returns `false` if the peer already exists.
    pub fn register_peer(&mut self, peer: PeerId, info: PeerInfo) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }

        self.peers.insert(peer, info);
        self.peer_documents.insert(peer, HashSet::new());
        true
    }

    /// Unregister a peer and remove all its memberships.
    ///
    /// Returns the peer info if it existed, along with the documents it had
    /// joined.
    pub fn unregister_peer(&mut self, peer: PeerId) -> Option<(PeerInfo, HashSet<String>)> {
        let info = self.peers.remove(&peer)?;
        let documents = self.peer_documents.remove(&peer).unwrap_or_default();

        for name in &documents {
            if let Some(members) = self.document_peers.get_mut(name) {
                members.remove(&peer);
                if members.is_empty() {
                    self.document_peers.remove(name);
                }
            }
        }

        Some((info, documents))
    }

    /// Peer metadata. `None` if the peer doesn't exist.
    pub fn peer(&self, peer: PeerId) -> Option<&PeerInfo> {
        self.peers.get(&peer)
    }

    /// Check if a peer is registered.
    pub fn has_peer(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Record that a peer joined a document.
    ///
    /// Returns `false` if the peer is not registered.
    pub fn join(&mut self, peer: PeerId, document: &str) -> bool {
        if !self.peers.contains_key(&peer) {
            return false;
        }

        self.document_peers.entry(document.to_string()).or_default().insert(peer);
        self.peer_documents.entry(peer).or_default().insert(document.to_string());
        true
    }

    /// Record that a peer left a document.
    ///
    /// Returns `true` if the peer was a member and is now removed.
    pub fn leave(&mut self, peer: PeerId, document: &str) -> bool {
        let removed_from_document =
            self.document_peers.get_mut(document).is_some_and(|p| p.remove(&peer));

        let removed_from_peer =
            self.peer_documents.get_mut(&peer).is_some_and(|d| d.remove(document));

        if self.document_peers.get(document).is_some_and(HashSet::is_empty) {
            self.document_peers.remove(document);
        }

        removed_from_document && removed_from_peer
    }

    /// Check if a peer has joined a document.
    pub fn is_member(&self, peer: PeerId, document: &str) -> bool {
        self.document_peers.get(document).is_some_and(|p| p.contains(&peer))
    }

    /// All peers that joined a document.
    pub fn peers_in_document(&self, document: &str) -> impl Iterator<Item = PeerId> + '_ {
        self.document_peers.get(document).into_iter().flat_map(|p| p.iter().copied())
    }

    /// All documents a peer has joined.
    pub fn documents_for_peer(&self, peer: PeerId) -> impl Iterator<Item = &str> + '_ {
        self.peer_documents.get(&peer).into_iter().flat_map(|d| d.iter().map(String::as_str))
    }

    /// All registered peers.
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    /// Total number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of peers that joined a document.
    pub fn document_peer_count(&self, document: &str) -> usize {
        self.document_peers.get(document).map_or(0, HashSet::len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup_peer() {
        let mut registry = ConnectionRegistry::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        assert!(registry.register_peer(1, PeerInfo::with_addr(addr)));
        assert!(registry.has_peer(1));
        assert!(!registry.has_peer(2));
        assert_eq!(registry.peer(1).unwrap().remote_addr, Some(addr));
    }

    #[test]
    fn register_duplicate_peer_fails() {
        let mut registry = ConnectionRegistry::new();

        assert!(registry.register_peer(1, PeerInfo::default()));
        assert!(!registry.register_peer(1, PeerInfo::default()));
    }

    #[test]
    fn join_and_lookup() {
        let mut registry = ConnectionRegistry::new();
        registry.register_peer(1, PeerInfo::default());
        registry.register_peer(2, PeerInfo::default());

        assert!(registry.join(1, "budget"));
        assert!(registry.join(2, "budget"));

        assert!(registry.is_member(1, "budget"));
        let mut peers: Vec<_> = registry.peers_in_document("budget").collect();
        peers.sort_unstable();
        assert_eq!(peers, vec![1, 2]);
    }

    #[test]
    fn join_unregistered_peer_fails() {
        let mut registry = ConnectionRegistry::new();
        assert!(!registry.join(999, "budget"));
        assert_eq!(registry.document_peer_count("budget"), 0);
    }

    #[test]
    fn leave_removes_from_both_maps() {
        let mut registry = ConnectionRegistry::new();
        registry.register_peer(1, PeerInfo::default());
        registry.join(1, "budget");

        assert!(registry.leave(1, "budget"));
        assert!(!registry.leave(1, "budget"));
        assert!(!registry.is_member(1, "budget"));
        assert_eq!(registry.documents_for_peer(1).count(), 0);
    }

    #[test]
    fn unregister_peer_removes_all_memberships() {
        let mut registry = ConnectionRegistry::new();
        registry.register_peer(1, PeerInfo::default());
        registry.register_peer(2, PeerInfo::default());
        registry.join(1, "a");
        registry.join(1, "b");
        registry.join(2, "a");

        let (_, documents) = registry.unregister_peer(1).unwrap();
        assert_eq!(documents.len(), 2);
        assert!(documents.contains("a"));
        assert!(documents.contains("b"));

        assert_eq!(registry.peers_in_document("a").collect::<Vec<_>>(), vec![2]);
        assert_eq!(registry.document_peer_count("b"), 0);
        assert_eq!(registry.peer_count(), 1);
    }
}
