//! Peer registry for the reference overlay node.
//!
//! Maps overlay addresses to the outbound queue of the link that reached
//! them. Envelopes for an address nobody has announced yet are parked until
//! a peer says hello with that address.

use courier_types::{Address, Envelope};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::message::MeshMessage;

/// Envelopes parked per unannounced address before new ones are dropped.
pub const MAX_PENDING_PER_ADDRESS: usize = 256;

/// Outbound queue of one peer link.
pub type PeerSender = mpsc::UnboundedSender<MeshMessage>;

/// Outcome of routing one envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    /// Handed to a peer link.
    Forwarded,
    /// Parked until the address is announced.
    Held,
    /// Discarded because the address already has a full backlog.
    Dropped,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<Address, PeerSender>,
    pending: HashMap<Address, Vec<Envelope>>,
    known_uris: HashSet<String>,
}

/// Thread-safe registry of live peer links.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer after its hello and flush anything held for it.
    ///
    /// A newer link for the same address replaces the older one.
    pub fn add_peer(&self, address: Address, sender: PeerSender) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = inner.pending.remove(&address) {
            for env in held {
                let _ = sender.send(MeshMessage::deliver(&env));
            }
        }
        inner.peers.insert(address, sender);
    }

    /// Drop a peer, but only if `sender` is still the registered link.
    pub fn remove_peer(&self, address: &Address, sender: &PeerSender) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner
            .peers
            .get(address)
            .is_some_and(|current| current.same_channel(sender))
        {
            inner.peers.remove(address);
        }
    }

    /// Forward to the peer owning `envelope.to()`, or hold it. At most
    /// [`MAX_PENDING_PER_ADDRESS`] envelopes are held for one address.
    pub fn route(&self, envelope: Envelope) -> Route {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let to = envelope.to().clone();
        if let Some(sender) = inner.peers.get(&to) {
            if sender.send(MeshMessage::deliver(&envelope)).is_ok() {
                return Route::Forwarded;
            }
            inner.peers.remove(&to);
        }
        let held = inner.pending.entry(to).or_default();
        if held.len() >= MAX_PENDING_PER_ADDRESS {
            return Route::Dropped;
        }
        held.push(envelope);
        Route::Held
    }

    /// Remember a listening URI. Returns `true` the first time it is seen.
    pub fn learn_uri(&self, uri: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.known_uris.insert(uri.to_string())
    }

    pub fn known_uris(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.known_uris.iter().cloned().collect()
    }

    /// Send a message to every live link.
    pub fn broadcast(&self, msg: &MeshMessage) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        for sender in inner.peers.values() {
            let _ = sender.send(msg.clone());
        }
    }

    pub fn is_known(&self, address: &Address) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.peers.contains_key(address)
    }

    pub fn connected_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.peers.len()
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.pending.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::PublicId;

    fn env(to: &str, body: &str) -> Envelope {
        let protocol: PublicId = "courier/default:0.1.0".parse().unwrap();
        Envelope::new(to, "me", protocol, body.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn test_route_to_known_peer() {
        let registry = PeerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.add_peer(Address::from("peer"), tx);

        assert_eq!(registry.route(env("peer", "hi")), Route::Forwarded);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.envelope().unwrap(), Some(env("peer", "hi")));
    }

    #[test]
    fn test_held_until_hello() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.route(env("late", "one")), Route::Held);
        assert_eq!(registry.route(env("late", "two")), Route::Held);
        assert_eq!(registry.pending_count(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.add_peer(Address::from("late"), tx);
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(rx.try_recv().unwrap().envelope().unwrap(), Some(env("late", "one")));
        assert_eq!(rx.try_recv().unwrap().envelope().unwrap(), Some(env("late", "two")));
    }

    #[test]
    fn test_backlog_capped_per_address() {
        let registry = PeerRegistry::new();
        for i in 0..MAX_PENDING_PER_ADDRESS {
            assert_eq!(registry.route(env("silent", &i.to_string())), Route::Held);
        }
        assert_eq!(registry.route(env("silent", "overflow")), Route::Dropped);
        assert_eq!(registry.pending_count(), MAX_PENDING_PER_ADDRESS);

        // Other addresses keep their own allowance.
        assert_eq!(registry.route(env("other", "x")), Route::Held);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.add_peer(Address::from("silent"), tx);
        let mut delivered = 0;
        while let Ok(msg) = rx.try_recv() {
            assert_ne!(msg.envelope().unwrap(), Some(env("silent", "overflow")));
            delivered += 1;
        }
        assert_eq!(delivered, MAX_PENDING_PER_ADDRESS);
        assert_eq!(registry.route(env("silent", "after")), Route::Forwarded);
    }

    #[test]
    fn test_closed_link_falls_back_to_hold() {
        let registry = PeerRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add_peer(Address::from("gone"), tx);
        drop(rx);

        assert_eq!(registry.route(env("gone", "x")), Route::Held);
        assert!(!registry.is_known(&Address::from("gone")));
    }

    #[test]
    fn test_remove_only_current_link() {
        let registry = PeerRegistry::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        let addr = Address::from("peer");
        registry.add_peer(addr.clone(), old_tx.clone());
        registry.add_peer(addr.clone(), new_tx.clone());

        registry.remove_peer(&addr, &old_tx);
        assert_eq!(registry.connected_count(), 1);
        registry.remove_peer(&addr, &new_tx);
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn test_learn_uri_once() {
        let registry = PeerRegistry::new();
        assert!(registry.learn_uri("127.0.0.1:9000"));
        assert!(!registry.learn_uri("127.0.0.1:9000"));
        assert_eq!(registry.known_uris(), vec!["127.0.0.1:9000".to_string()]);
    }
}
