//! The peer: a registry of replicas, one per share address.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use rand::RngCore;

use crate::{keys::base32, keys::ShareAddress, replica::Replica};

/// Changes to a peer's share set.
///
/// Sync coordinators listen to these to keep their common-share sets current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A replica was added for this share.
    ReplicaAdded(ShareAddress),
    /// The replica for this share was removed.
    ReplicaRemoved(ShareAddress),
}

/// A registry mapping share addresses to replicas: the unit a sync
/// coordinator operates against. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

#[derive(Debug)]
struct PeerInner {
    peer_id: String,
    replicas: RwLock<BTreeMap<ShareAddress, Replica>>,
    subscribers: RwLock<Vec<flume::Sender<PeerEvent>>>,
}

impl Default for PeerInner {
    fn default() -> Self {
        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        PeerInner {
            peer_id: base32::fmt(id_bytes),
            replicas: RwLock::new(BTreeMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl Peer {
    /// Create an empty peer with a fresh random id.
    pub fn new() -> Self {
        Self::default()
    }

    /// This peer's random id. Identifies the peer within sync exchanges; not
    /// a cryptographic identity.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Register a replica under its share address. Replaces any previous
    /// replica for the same share.
    pub fn add_replica(&self, replica: Replica) {
        let share = replica.share().clone();
        self.inner
            .replicas
            .write()
            .insert(share.clone(), replica);
        self.emit(PeerEvent::ReplicaAdded(share));
    }

    /// Remove and return the replica for a share, if present. Does not close
    /// the replica.
    pub fn remove_replica(&self, share: &ShareAddress) -> Option<Replica> {
        let removed = self.inner.replicas.write().remove(share);
        if removed.is_some() {
            self.emit(PeerEvent::ReplicaRemoved(share.clone()));
        }
        removed
    }

    /// The replica for a share, if present.
    pub fn replica(&self, share: &ShareAddress) -> Option<Replica> {
        self.inner.replicas.read().get(share).cloned()
    }

    /// All share addresses this peer currently holds, sorted.
    pub fn shares(&self) -> Vec<ShareAddress> {
        self.inner.replicas.read().keys().cloned().collect()
    }

    /// Subscribe to share-set changes.
    pub fn subscribe(&self) -> flume::Receiver<PeerEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.subscribers.write().push(tx);
        rx
    }

    fn emit(&self, event: PeerEvent) {
        self.inner
            .subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{store::memory::MemoryDriver, validation::FmtD1};

    fn replica(share: &str) -> Replica {
        let share: ShareAddress = share.parse().unwrap();
        Replica::open(
            share.clone(),
            Arc::new(FmtD1),
            Arc::new(MemoryDriver::new(share)),
        )
        .unwrap()
    }

    #[test]
    fn registry_roundtrip() {
        let peer = Peer::new();
        let events = peer.subscribe();
        assert!(peer.shares().is_empty());

        peer.add_replica(replica("+gardening.pals"));
        peer.add_replica(replica("+chat.pals"));
        let shares: Vec<String> = peer.shares().iter().map(|s| s.to_string()).collect();
        assert_eq!(shares, ["+chat.pals", "+gardening.pals"]);

        let share: ShareAddress = "+chat.pals".parse().unwrap();
        assert!(peer.replica(&share).is_some());
        assert!(peer.remove_replica(&share).is_some());
        assert!(peer.replica(&share).is_none());
        assert!(peer.remove_replica(&share).is_none());

        let seen: Vec<PeerEvent> = events.drain().collect();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], PeerEvent::ReplicaRemoved(share));
    }

    #[test]
    fn peer_ids_are_distinct() {
        assert_ne!(Peer::new().peer_id(), Peer::new().peer_id());
    }
}
