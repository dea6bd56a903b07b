// Envelope body encoding.
//
// Body layout (the 4-byte length prefix is added by `framing.rs`):
//
//   u32_le(tag) || header || variant body
//
// `header` is the bincode encoding of the routing fields in declaration
// order. Core variant bodies are bincode as well; `ClockSync` and `Heartbeat`
// have an empty body. Application bodies are the raw collaborator bytes, so
// the relay can forward them without understanding them.
//
// bincode v1's default options (fixed-width little-endian integers, u64
// length prefixes) are part of the wire format. Decoding always runs over a
// borrowed slice, where bincode bounds every length prefix by the bytes
// actually present.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::framing::MAX_PAYLOAD_LEN;
use crate::message::{Envelope, FIRST_APPLICATION_TAG, MessageKind, Payload};
use crate::types::PeerId;

const TAG_LEN: usize = 4;

#[derive(Serialize)]
struct HeaderRef<'a> {
    created_at: i64,
    is_realtime: bool,
    destination_peers: &'a Option<Vec<PeerId>>,
    source_peer: &'a Option<PeerId>,
}

#[derive(Serialize, Deserialize)]
struct Header {
    created_at: i64,
    is_realtime: bool,
    destination_peers: Option<Vec<PeerId>>,
    source_peer: Option<PeerId>,
}

/// Serialize an envelope into a frame body.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    if let Payload::Application { kind, .. } = &envelope.payload {
        if *kind < FIRST_APPLICATION_TAG {
            return Err(ProtocolError::ReservedKind(*kind));
        }
    }

    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&envelope.kind().tag().to_le_bytes());
    let header = HeaderRef {
        created_at: envelope.created_at,
        is_realtime: envelope.is_realtime,
        destination_peers: &envelope.destination_peers,
        source_peer: &envelope.source_peer,
    };
    bincode::serialize_into(&mut body, &header).map_err(ProtocolError::Encode)?;

    match &envelope.payload {
        Payload::PeerQuit { quit_peer } => bincode::serialize_into(&mut body, quit_peer),
        Payload::PeerIdAnnounce(announce) => bincode::serialize_into(&mut body, announce),
        Payload::HostPeer { host } => bincode::serialize_into(&mut body, host),
        Payload::ClockSync | Payload::Heartbeat => Ok(()),
        Payload::Application { data, .. } => {
            body.extend_from_slice(data);
            Ok(())
        }
    }
    .map_err(ProtocolError::Encode)?;

    if body.len() > MAX_PAYLOAD_LEN as usize {
        return Err(ProtocolError::Oversized {
            len: body.len() as u64,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(body)
}

/// Parse a frame body back into an envelope.
pub fn decode(body: &[u8]) -> Result<Envelope, ProtocolError> {
    if body.len() < TAG_LEN {
        return Err(ProtocolError::Malformed(format!(
            "body of {} bytes is shorter than the tag",
            body.len()
        )));
    }
    let (tag_bytes, rest) = body.split_at(TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(tag_bytes);
    let kind = MessageKind::from_tag(u32::from_le_bytes(tag));

    let header: Header = bincode::deserialize(rest)
        .map_err(|e| ProtocolError::Malformed(format!("header: {e}")))?;
    let header_len = serialized_len(&header)?;
    let rest = rest
        .get(header_len..)
        .ok_or_else(|| ProtocolError::Malformed("header overruns body".into()))?;

    let payload = match kind {
        MessageKind::PeerQuit => Payload::PeerQuit {
            quit_peer: decode_exact(rest)?,
        },
        MessageKind::PeerIdAnnounce => Payload::PeerIdAnnounce(decode_exact(rest)?),
        MessageKind::ClockSync => {
            expect_empty(rest, kind)?;
            Payload::ClockSync
        }
        MessageKind::Heartbeat => {
            expect_empty(rest, kind)?;
            Payload::Heartbeat
        }
        MessageKind::HostPeer => Payload::HostPeer {
            host: decode_exact(rest)?,
        },
        MessageKind::Application(kind) => Payload::Application {
            kind,
            data: rest.to_vec(),
        },
    };

    Ok(Envelope {
        created_at: header.created_at,
        is_realtime: header.is_realtime,
        destination_peers: header.destination_peers,
        source_peer: header.source_peer,
        payload,
    })
}

/// Deserialize `T` and require that it spans the whole slice.
fn decode_exact<T: DeserializeOwned + Serialize>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let value: T =
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let used = serialized_len(&value)?;
    if used != bytes.len() {
        return Err(ProtocolError::Malformed(format!(
            "{} trailing bytes after payload",
            bytes.len() - used
        )));
    }
    Ok(value)
}

fn expect_empty(bytes: &[u8], kind: MessageKind) -> Result<(), ProtocolError> {
    if bytes.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::Malformed(format!(
            "{kind:?} carries {} unexpected bytes",
            bytes.len()
        )))
    }
}

fn serialized_len<T: Serialize>(value: &T) -> Result<usize, ProtocolError> {
    let len = bincode::serialized_size(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    usize::try_from(len).map_err(|_| ProtocolError::Malformed("length overflow".into()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::message::PeerAnnounce;
    use crate::types::ProtocolVersion;

    fn peer_id() -> impl Strategy<Value = PeerId> {
        "[a-z0-9-]{1,12}".prop_map(PeerId::new)
    }

    fn payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            proptest::option::of(peer_id()).prop_map(|quit_peer| Payload::PeerQuit { quit_peer }),
            (".{0,16}", any::<u16>(), any::<u16>(), any::<bool>()).prop_map(
                |(name, major, minor, needs_response)| {
                    Payload::PeerIdAnnounce(PeerAnnounce {
                        name,
                        version: ProtocolVersion::new(major, minor, 0),
                        needs_response,
                    })
                }
            ),
            Just(Payload::ClockSync),
            Just(Payload::Heartbeat),
            proptest::option::of(peer_id()).prop_map(|host| Payload::HostPeer { host }),
            (
                FIRST_APPLICATION_TAG..10_000u32,
                proptest::collection::vec(any::<u8>(), 0..64)
            )
                .prop_map(|(kind, data)| Payload::Application { kind, data }),
        ]
    }

    fn envelope() -> impl Strategy<Value = Envelope> {
        (
            any::<i64>(),
            any::<bool>(),
            proptest::option::of(proptest::collection::vec(peer_id(), 0..4)),
            proptest::option::of(peer_id()),
            payload(),
        )
            .prop_map(
                |(created_at, is_realtime, destination_peers, source_peer, payload)| Envelope {
                    created_at,
                    is_realtime,
                    destination_peers,
                    source_peer,
                    payload,
                },
            )
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(env in envelope()) {
            let body = encode(&env).unwrap();
            prop_assert_eq!(decode(&body).unwrap(), env);
        }
    }

    #[test]
    fn tag_leads_the_body() {
        let env = Envelope::new(Payload::Heartbeat, 7);
        let body = encode(&env).unwrap();
        assert_eq!(&body[..4], &3u32.to_le_bytes());
        // created_at follows as i64 LE.
        assert_eq!(&body[4..12], &7i64.to_le_bytes());
    }

    #[test]
    fn application_tag_is_its_kind() {
        let env = Envelope::new(
            Payload::Application {
                kind: 77,
                data: vec![1, 2, 3],
            },
            0,
        );
        let body = encode(&env).unwrap();
        assert_eq!(&body[..4], &77u32.to_le_bytes());
        assert_eq!(&body[body.len() - 3..], &[1, 2, 3]);
    }

    #[test]
    fn reserved_application_kind_rejected() {
        let env = Envelope::new(
            Payload::Application {
                kind: 2,
                data: vec![],
            },
            0,
        );
        assert!(matches!(encode(&env), Err(ProtocolError::ReservedKind(2))));
    }

    #[test]
    fn truncated_body_is_malformed() {
        let env = Envelope::new(
            Payload::HostPeer {
                host: Some(PeerId::new("alice")),
            },
            0,
        );
        let body = encode(&env).unwrap();
        let err = decode(&body[..body.len() - 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)), "{err:?}");
        assert!(matches!(decode(&[1, 0]), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut body = encode(&Envelope::new(Payload::ClockSync, 0)).unwrap();
        body.push(0xFF);
        assert!(matches!(decode(&body), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn invalid_bool_is_malformed() {
        let mut body = encode(&Envelope::new(Payload::Heartbeat, 0)).unwrap();
        // Byte 12 is `is_realtime`.
        body[12] = 9;
        assert!(matches!(decode(&body), Err(ProtocolError::Malformed(_))));
    }
}
