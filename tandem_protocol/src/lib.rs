// tandem_protocol: wire protocol shared by the relay and session clients.
//
// This crate defines the envelope, its binary encoding, and the framing used
// by the relay (`tandem_relay`) and peers (`tandem_client`) over TCP. It has
// no networking of its own beyond `Read`/`Write` framing.
//
// Module overview:
// - `types.rs`:    `PeerId`, `ProtocolVersion`, the reserved server id.
// - `message.rs`:  `Envelope`, the closed `Payload` set, `MessageKind` tags.
// - `codec.rs`:    Envelope body encoding: u32 LE tag, bincode header, then
//                  the variant body (raw bytes for application payloads).
// - `framing.rs`:  4-byte little-endian length prefix over any stream, with
//                  drain-and-continue handling of oversized frames and a
//                  resumable `FrameReader` for sockets with read timeouts.
// - `clock.rs`:    Relay-clock estimation from a clock-sync round trip.
// - `throttle.rs`: Per-interval and per-kind log throttling.
// - `error.rs`:    `ProtocolError`.
//
// Design decisions:
// - **bincode v1 with default options.** Fixed-width little-endian integers
//   keep the header layout predictable for both ends.
// - **Application payloads as opaque `Vec<u8>`.** The relay forwards them
//   without decoding, so collaborators can evolve their formats freely.
// - **No async runtime.** Framing uses `std::io::Read`/`Write`, compatible
//   with blocking TCP streams and in-memory buffers alike.

pub mod clock;
pub mod codec;
pub mod error;
pub mod framing;
pub mod message;
pub mod throttle;
pub mod types;

pub use clock::{ClockSync, ServerClock, local_now_ms};
pub use error::ProtocolError;
pub use framing::{FrameReader, MAX_PAYLOAD_LEN, read_envelope, write_envelope};
pub use message::{Envelope, FIRST_APPLICATION_TAG, MessageKind, Payload, PeerAnnounce};
pub use throttle::{KindThrottle, Throttler};
pub use types::{PROTOCOL_VERSION, PeerId, ProtocolVersion, SERVER_PEER_ID};
