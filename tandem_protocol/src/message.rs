// Envelope and payload types exchanged between peers and the relay.
//
// Every frame on the wire carries exactly one `Envelope`: routing metadata
// (origin timestamp, realtime flag, destinations, source) plus one `Payload`
// variant from a closed set. The core variants drive session plumbing
// (identity, quit, clock sync, heartbeat, host designation). Everything a
// collaborator sends travels as `Payload::Application` with a numeric kind
// the core never inspects.
//
// `MessageKind` is the payload discriminant. It doubles as the on-wire tag
// (see `codec.rs`) and as the key handlers subscribe under.

use serde::{Deserialize, Serialize};

use crate::types::{PeerId, ProtocolVersion};

/// First tag available to application payloads. Tags below it belong to the
/// core variants.
pub const FIRST_APPLICATION_TAG: u32 = 5;

/// Discriminant of a `Payload`, stable across builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    PeerQuit,
    PeerIdAnnounce,
    ClockSync,
    Heartbeat,
    HostPeer,
    Application(u32),
}

impl MessageKind {
    /// Numeric wire tag.
    pub fn tag(self) -> u32 {
        match self {
            MessageKind::PeerQuit => 0,
            MessageKind::PeerIdAnnounce => 1,
            MessageKind::ClockSync => 2,
            MessageKind::Heartbeat => 3,
            MessageKind::HostPeer => 4,
            MessageKind::Application(kind) => kind,
        }
    }

    /// Inverse of `tag`. Every tag at or above `FIRST_APPLICATION_TAG` is an
    /// application kind.
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            0 => MessageKind::PeerQuit,
            1 => MessageKind::PeerIdAnnounce,
            2 => MessageKind::ClockSync,
            3 => MessageKind::Heartbeat,
            4 => MessageKind::HostPeer,
            kind => MessageKind::Application(kind),
        }
    }
}

/// Identity announcement body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnounce {
    /// Display name shown to other peers.
    pub name: String,
    pub version: ProtocolVersion,
    /// Receivers reply with their own announce (with this flag cleared).
    pub needs_response: bool,
}

/// Closed set of payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// A peer left. Relay-originated quits name the departed peer; a
    /// client-originated quit leaves it empty and means its own source.
    PeerQuit { quit_peer: Option<PeerId> },
    /// Identity announcement; the relay binds the sending connection to the
    /// envelope's `source_peer`.
    PeerIdAnnounce(PeerAnnounce),
    /// Clock-sync request (client → relay) or reply (relay → client). The
    /// timestamp travels in `Envelope::created_at`.
    ClockSync,
    /// Liveness only; never forwarded.
    Heartbeat,
    /// Host designation. Sent by a client it is a query; sent by the relay it
    /// announces the current host.
    HostPeer { host: Option<PeerId> },
    /// Collaborator payload, opaque to the core.
    Application { kind: u32, data: Vec<u8> },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::PeerQuit { .. } => MessageKind::PeerQuit,
            Payload::PeerIdAnnounce(_) => MessageKind::PeerIdAnnounce,
            Payload::ClockSync => MessageKind::ClockSync,
            Payload::Heartbeat => MessageKind::Heartbeat,
            Payload::HostPeer { .. } => MessageKind::HostPeer,
            Payload::Application { kind, .. } => MessageKind::Application(*kind),
        }
    }
}

/// Unit of wire exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Origin timestamp in relay-clock milliseconds.
    pub created_at: i64,
    /// Receivers drop realtime envelopes older than their staleness threshold.
    pub is_realtime: bool,
    /// `None` broadcasts to every other bound peer.
    pub destination_peers: Option<Vec<PeerId>>,
    /// Overwritten by the relay with the connection's bound id.
    pub source_peer: Option<PeerId>,
    pub payload: Payload,
}

impl Envelope {
    /// A non-realtime broadcast with no source.
    pub fn new(payload: Payload, created_at: i64) -> Self {
        Self {
            created_at,
            is_realtime: false,
            destination_peers: None,
            source_peer: None,
            payload,
        }
    }

    pub fn realtime(mut self) -> Self {
        self.is_realtime = true;
        self
    }

    pub fn to_peers(mut self, peers: Vec<PeerId>) -> Self {
        self.destination_peers = Some(peers);
        self
    }

    pub fn from_peer(mut self, peer: PeerId) -> Self {
        self.source_peer = Some(peer);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// True when `peer` is among the destinations, or the envelope is a
    /// broadcast.
    pub fn is_addressed_to(&self, peer: &PeerId) -> bool {
        match &self.destination_peers {
            Some(peers) => peers.contains(peer),
            None => true,
        }
    }

    /// True for a realtime envelope whose age exceeds `staleness_ms`.
    pub fn is_expired(&self, now_ms: i64, staleness_ms: i64) -> bool {
        self.is_realtime && now_ms.saturating_sub(self.created_at) > staleness_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        assert_eq!(MessageKind::PeerQuit.tag(), 0);
        assert_eq!(MessageKind::PeerIdAnnounce.tag(), 1);
        assert_eq!(MessageKind::ClockSync.tag(), 2);
        assert_eq!(MessageKind::Heartbeat.tag(), 3);
        assert_eq!(MessageKind::HostPeer.tag(), 4);
        assert_eq!(MessageKind::from_tag(42), MessageKind::Application(42));
        assert_eq!(
            MessageKind::from_tag(FIRST_APPLICATION_TAG),
            MessageKind::Application(FIRST_APPLICATION_TAG)
        );
    }

    #[test]
    fn broadcast_reaches_everyone() {
        let env = Envelope::new(Payload::Heartbeat, 0);
        assert!(env.is_addressed_to(&PeerId::new("anyone")));
    }

    #[test]
    fn directed_envelope_filters_by_destination() {
        let env = Envelope::new(Payload::Heartbeat, 0).to_peers(vec![PeerId::new("bob")]);
        assert!(env.is_addressed_to(&PeerId::new("bob")));
        assert!(!env.is_addressed_to(&PeerId::new("carol")));
    }

    #[test]
    fn expiry_applies_only_to_realtime() {
        let old = Envelope::new(Payload::Heartbeat, 0);
        assert!(!old.is_expired(10_000, 1000));
        let old_realtime = old.realtime();
        assert!(old_realtime.is_expired(10_000, 1000));
        assert!(!old_realtime.is_expired(1000, 1000));
    }
}
