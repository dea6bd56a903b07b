// Connection ↔ peer-id bindings and host designation.
//
// `Bindings` is the relay's bookkeeping core. It never touches a socket:
// `server.rs` feeds it bind/unbind/rotate calls under its state mutex and
// acts on the returned outcomes (close a displaced connection, broadcast a
// quit, broadcast a host change).
//
// Invariants, held after every public call:
// - `by_peer` and `by_connection` are exact inverses.
// - `host` is `None` iff nothing is bound, and otherwise names a bound peer.
//
// Rebinding rules:
// - Same connection, new id: the old id is released (reported as
//   `replaced_peer` so the server can announce its departure).
// - Same id, new connection: the id moves; the old connection is reported as
//   `displaced_connection` so the server can close it. The peer itself never
//   left, so no quit is reported.
//
// Host selection is uniform over bound peers. A `HostChange` is only
// returned when the designee actually differs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tandem_protocol::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostChange {
    pub previous: Option<PeerId>,
    pub current: Option<PeerId>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BindOutcome {
    /// Connection that held the id before and must be closed.
    pub displaced_connection: Option<ConnectionId>,
    /// Id this connection held before; it is no longer bound anywhere.
    pub replaced_peer: Option<PeerId>,
    pub host_change: Option<HostChange>,
}

pub struct Bindings {
    by_peer: BTreeMap<PeerId, ConnectionId>,
    by_connection: HashMap<ConnectionId, PeerId>,
    host: Option<PeerId>,
    rng: fastrand::Rng,
}

impl Default for Bindings {
    fn default() -> Self {
        Self::new()
    }
}

impl Bindings {
    pub fn new() -> Self {
        Self::with_rng(fastrand::Rng::new())
    }

    /// Deterministic host selection, for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(fastrand::Rng::with_seed(seed))
    }

    fn with_rng(rng: fastrand::Rng) -> Self {
        Self {
            by_peer: BTreeMap::new(),
            by_connection: HashMap::new(),
            host: None,
            rng,
        }
    }

    /// Bind `connection` to `peer`.
    pub fn bind(&mut self, peer: PeerId, connection: ConnectionId) -> BindOutcome {
        if self.by_connection.get(&connection) == Some(&peer) {
            return BindOutcome::default();
        }
        let was_empty = self.by_peer.is_empty();

        let replaced_peer = self.by_connection.remove(&connection).inspect(|old| {
            self.by_peer.remove(old);
        });
        let displaced_connection = self.by_peer.insert(peer.clone(), connection);
        if let Some(stale) = displaced_connection {
            self.by_connection.remove(&stale);
        }
        self.by_connection.insert(connection, peer);

        BindOutcome {
            displaced_connection,
            replaced_peer,
            host_change: self.settle_host(was_empty),
        }
    }

    /// Forget whatever `connection` was bound to. Returns the released id and
    /// any resulting host change.
    pub fn unbind_connection(
        &mut self,
        connection: ConnectionId,
    ) -> Option<(PeerId, Option<HostChange>)> {
        let peer = self.by_connection.remove(&connection)?;
        self.by_peer.remove(&peer);
        let change = self.settle_host(false);
        Some((peer, change))
    }

    /// Draw a new host. Returns a change only if a different peer won.
    pub fn rotate_host(&mut self) -> Option<HostChange> {
        self.settle_host(true)
    }

    pub fn peer_of(&self, connection: ConnectionId) -> Option<&PeerId> {
        self.by_connection.get(&connection)
    }

    pub fn connection_of(&self, peer: &PeerId) -> Option<ConnectionId> {
        self.by_peer.get(peer).copied()
    }

    pub fn host(&self) -> Option<&PeerId> {
        self.host.as_ref()
    }

    /// Bound connections, in peer-id order.
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.by_peer.values().copied()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> + '_ {
        self.by_peer.keys()
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    /// Re-draw the host if forced or if the current one is no longer bound.
    fn settle_host(&mut self, force: bool) -> Option<HostChange> {
        let previous = self.host.clone();
        let still_bound = previous
            .as_ref()
            .is_some_and(|host| self.by_peer.contains_key(host));
        if force || !still_bound {
            self.host = self.pick_random();
        }
        (self.host != previous).then(|| HostChange {
            previous,
            current: self.host.clone(),
        })
    }

    fn pick_random(&mut self) -> Option<PeerId> {
        if self.by_peer.is_empty() {
            return None;
        }
        let index = self.rng.usize(..self.by_peer.len());
        self.by_peer.keys().nth(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    fn assert_consistent(b: &Bindings) {
        assert_eq!(b.by_peer.len(), b.by_connection.len());
        for (p, c) in &b.by_peer {
            assert_eq!(b.by_connection.get(c), Some(p));
        }
        match b.host() {
            None => assert!(b.is_empty()),
            Some(host) => assert!(b.by_peer.contains_key(host)),
        }
    }

    #[test]
    fn first_bind_makes_host() {
        let mut b = Bindings::with_seed(1);
        let outcome = b.bind(peer("alice"), ConnectionId(0));
        assert_eq!(
            outcome.host_change,
            Some(HostChange {
                previous: None,
                current: Some(peer("alice"))
            })
        );
        assert_eq!(b.host(), Some(&peer("alice")));
    }

    #[test]
    fn second_bind_keeps_host() {
        let mut b = Bindings::with_seed(1);
        b.bind(peer("alice"), ConnectionId(0));
        let outcome = b.bind(peer("bob"), ConnectionId(1));
        assert_eq!(outcome, BindOutcome::default());
        assert_eq!(b.host(), Some(&peer("alice")));
    }

    #[test]
    fn repeated_announce_is_noop() {
        let mut b = Bindings::with_seed(1);
        b.bind(peer("alice"), ConnectionId(0));
        assert_eq!(b.bind(peer("alice"), ConnectionId(0)), BindOutcome::default());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn id_takeover_displaces_old_connection() {
        let mut b = Bindings::with_seed(1);
        b.bind(peer("alice"), ConnectionId(0));
        let outcome = b.bind(peer("alice"), ConnectionId(7));
        assert_eq!(outcome.displaced_connection, Some(ConnectionId(0)));
        assert_eq!(outcome.replaced_peer, None);
        assert_eq!(outcome.host_change, None);
        assert_eq!(b.connection_of(&peer("alice")), Some(ConnectionId(7)));
        assert!(b.peer_of(ConnectionId(0)).is_none());
        // Closing the displaced connection releases nothing.
        assert!(b.unbind_connection(ConnectionId(0)).is_none());
        assert_consistent(&b);
    }

    #[test]
    fn rename_on_same_connection_replaces_peer() {
        let mut b = Bindings::with_seed(1);
        b.bind(peer("alice"), ConnectionId(0));
        let outcome = b.bind(peer("alicia"), ConnectionId(0));
        assert_eq!(outcome.replaced_peer, Some(peer("alice")));
        assert_eq!(
            outcome.host_change.map(|c| c.current),
            Some(Some(peer("alicia")))
        );
        assert_consistent(&b);
    }

    #[test]
    fn host_unbind_hands_over() {
        let mut b = Bindings::with_seed(3);
        b.bind(peer("alice"), ConnectionId(0));
        b.bind(peer("bob"), ConnectionId(1));
        let host_conn = b.connection_of(b.host().unwrap()).unwrap();
        let other = if host_conn == ConnectionId(0) { peer("bob") } else { peer("alice") };

        let (_, change) = b.unbind_connection(host_conn).unwrap();
        assert_eq!(change.unwrap().current, Some(other.clone()));
        assert_eq!(b.host(), Some(&other));
    }

    #[test]
    fn last_unbind_clears_host() {
        let mut b = Bindings::with_seed(1);
        b.bind(peer("alice"), ConnectionId(0));
        let (released, change) = b.unbind_connection(ConnectionId(0)).unwrap();
        assert_eq!(released, peer("alice"));
        assert_eq!(change.unwrap().current, None);
        assert!(b.host().is_none());
    }

    #[test]
    fn rotation_with_single_peer_reports_nothing() {
        let mut b = Bindings::with_seed(1);
        b.bind(peer("alice"), ConnectionId(0));
        assert!(b.rotate_host().is_none());
    }

    #[test]
    fn rotation_eventually_changes_host() {
        let mut b = Bindings::with_seed(42);
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            b.bind(peer(name), ConnectionId(i as u64));
        }
        assert!((0..64).any(|_| b.rotate_host().is_some()));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Bind(u8, u8),
        Unbind(u8),
        Rotate,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..5, 0u8..6).prop_map(|(p, c)| Op::Bind(p, c)),
            (0u8..6).prop_map(Op::Unbind),
            Just(Op::Rotate),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_any_sequence(ops in proptest::collection::vec(op(), 0..64), seed in any::<u64>()) {
            let mut b = Bindings::with_seed(seed);
            for op in ops {
                let host_before = b.host().cloned();
                let change = match op {
                    Op::Bind(p, c) => b.bind(peer(&format!("p{p}")), ConnectionId(u64::from(c))).host_change,
                    Op::Unbind(c) => b.unbind_connection(ConnectionId(u64::from(c))).and_then(|(_, ch)| ch),
                    Op::Rotate => b.rotate_host(),
                };
                assert_consistent(&b);
                match change {
                    Some(change) => {
                        prop_assert_eq!(&change.previous, &host_before);
                        prop_assert_ne!(&change.previous, &change.current);
                        prop_assert_eq!(change.current.as_ref(), b.host());
                    }
                    None => prop_assert_eq!(host_before.as_ref(), b.host()),
                }
            }
        }
    }
}
