// Concurrent peer membership sets keyed by peer id.
use crate::{BrokerError, Peer, Publisher, Result, Subscriber};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Container for connected peers, used to add and remove them as they
/// connect to or disconnect from the broker.
///
/// All operations are safe from any number of tasks; the lock is never held
/// across I/O. There is no transactional grouping between calls: a peer may
/// be added between an `is_empty` check and the following `get_all`.
pub struct PeerPool<T: Peer + ?Sized> {
    peers: RwLock<HashMap<Uuid, Arc<T>>>,
}

/// Pool of connected publishers.
pub type PublisherPool = PeerPool<dyn Publisher>;

/// Pool of connected subscribers.
pub type SubscriberPool = PeerPool<dyn Subscriber>;

impl<T: Peer + ?Sized> PeerPool<T> {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a peer, keyed by its id. Fails with
    /// [`BrokerError::DuplicatePeer`] when the id is already present; the
    /// existing entry is preserved.
    pub fn add(&self, peer: Arc<T>) -> Result<()> {
        let id = peer.id();
        let mut peers = self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match peers.entry(id) {
            Entry::Occupied(_) => Err(BrokerError::DuplicatePeer(id)),
            Entry::Vacant(entry) => {
                entry.insert(peer);
                Ok(())
            }
        }
    }

    /// Remove the peer with this id, if present. Idempotent.
    pub fn remove(&self, id: Uuid) {
        let mut peers = self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        peers.remove(&id);
    }

    /// Snapshot the current membership for iteration concurrent with future
    /// mutations. Order is unspecified.
    pub fn get_all(&self) -> Vec<Arc<T>> {
        let peers = self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        peers.values().cloned().collect()
    }

    /// True iff no peers are present.
    pub fn is_empty(&self) -> bool {
        let peers = self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        peers.is_empty()
    }
}

impl<T: Peer + ?Sized> Default for PeerPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
