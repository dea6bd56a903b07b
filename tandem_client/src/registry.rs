// Peer registry: who else is in the session.
//
// The client-side source of truth for peer records. Entries are created and
// renamed by identity announcements and removed only by peer-quit messages
// (or `clear()` when the session ends). Observers subscribe per event kind
// and get a `SubscriptionId` back; unsubscribing one leaves the rest intact.
//
// The registry is shared (`Arc<PeerRegistry>`) between the session and its
// collaborators, so both tables sit behind mutexes. Observers run after the
// peer table lock is released, which lets them call `lookup()` / `peers()`
// from inside a callback.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tandem_protocol::PeerId;

/// A remote peer as known to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    /// Free-form locale tag set by collaborators; never interpreted here.
    pub locale: Option<String>,
}

/// Change emitted by `upsert` / `remove`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Added(Peer),
    Renamed { peer: Peer, old_name: String },
    Removed(Peer),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type PeerCallback = Arc<dyn Fn(&Peer) + Send + Sync>;
type RenameCallback = Arc<dyn Fn(&Peer, &str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    added: Vec<(SubscriptionId, PeerCallback)>,
    renamed: Vec<(SubscriptionId, RenameCallback)>,
    removed: Vec<(SubscriptionId, PeerCallback)>,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<PeerId, Peer>>,
    listeners: Mutex<Listeners>,
    next_subscription: AtomicU64,
}

/// A panicking observer must not take the registry down with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_peer_added(&self, f: impl Fn(&Peer) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id();
        lock(&self.listeners).added.push((id, Arc::new(f)));
        id
    }

    /// Called with the renamed peer and its previous name.
    pub fn on_peer_renamed(
        &self,
        f: impl Fn(&Peer, &str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        lock(&self.listeners).renamed.push((id, Arc::new(f)));
        id
    }

    pub fn on_peer_removed(&self, f: impl Fn(&Peer) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id();
        lock(&self.listeners).removed.push((id, Arc::new(f)));
        id
    }

    /// Drop one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before =
            listeners.added.len() + listeners.renamed.len() + listeners.removed.len();
        listeners.added.retain(|(sub, _)| *sub != id);
        listeners.renamed.retain(|(sub, _)| *sub != id);
        listeners.removed.retain(|(sub, _)| *sub != id);
        let after = listeners.added.len() + listeners.renamed.len() + listeners.removed.len();
        after != before
    }

    /// Insert a new peer or rename an existing one. Returns the event that
    /// was emitted, or `None` when the name is unchanged.
    pub fn upsert(&self, id: PeerId, name: &str) -> Option<PeerEvent> {
        let event = {
            let mut peers = lock(&self.peers);
            match peers.get_mut(&id) {
                Some(peer) if peer.name == name => None,
                Some(peer) => {
                    let old_name = std::mem::replace(&mut peer.name, name.to_owned());
                    Some(PeerEvent::Renamed {
                        peer: peer.clone(),
                        old_name,
                    })
                }
                None => {
                    let peer = Peer {
                        id: id.clone(),
                        name: name.to_owned(),
                        locale: None,
                    };
                    peers.insert(id, peer.clone());
                    Some(PeerEvent::Added(peer))
                }
            }
        };
        if let Some(event) = &event {
            self.emit(event);
        }
        event
    }

    /// Remove a peer. Absent ids are a no-op.
    pub fn remove(&self, id: &PeerId) -> Option<Peer> {
        let removed = lock(&self.peers).remove(id)?;
        self.emit(&PeerEvent::Removed(removed.clone()));
        Some(removed)
    }

    pub fn lookup(&self, id: &PeerId) -> Option<Peer> {
        lock(&self.peers).get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        lock(&self.peers).contains_key(id)
    }

    /// Returns false if the peer is unknown.
    pub fn set_locale(&self, id: &PeerId, locale: Option<String>) -> bool {
        match lock(&self.peers).get_mut(id) {
            Some(peer) => {
                peer.locale = locale;
                true
            }
            None => false,
        }
    }

    /// Snapshot of all peers, ordered by id.
    pub fn peers(&self) -> Vec<Peer> {
        lock(&self.peers).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.peers).is_empty()
    }

    /// Remove every peer, emitting `Removed` for each.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *lock(&self.peers));
        for peer in drained.into_values() {
            self.emit(&PeerEvent::Removed(peer));
        }
    }

    fn emit(&self, event: &PeerEvent) {
        // Clone the callbacks out so observers may subscribe or unsubscribe.
        match event {
            PeerEvent::Added(peer) => {
                let callbacks: Vec<PeerCallback> =
                    lock(&self.listeners).added.iter().map(|(_, f)| f.clone()).collect();
                for f in callbacks {
                    f(peer);
                }
            }
            PeerEvent::Renamed { peer, old_name } => {
                let callbacks: Vec<RenameCallback> = lock(&self.listeners)
                    .renamed
                    .iter()
                    .map(|(_, f)| f.clone())
                    .collect();
                for f in callbacks {
                    f(peer, old_name);
                }
            }
            PeerEvent::Removed(peer) => {
                let callbacks: Vec<PeerCallback> = lock(&self.listeners)
                    .removed
                    .iter()
                    .map(|(_, f)| f.clone())
                    .collect();
                for f in callbacks {
                    f(peer);
                }
            }
        }
    }
}
