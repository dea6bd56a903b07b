// Wire-level errors shared by the client and the relay.
//
// `Oversized` (the frame was already drained) and read timeouts are
// recoverable. Everything else ends the connection that produced it.

use std::io;

use thiserror::Error;

/// Errors raised while encoding, decoding, or reading frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared frame length above the limit. When raised by a reader the
    /// frame has already been drained and the stream is still framed.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: u64, max: u32 },

    /// Frame body does not parse into a known envelope. Stream position can
    /// no longer be trusted.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Application payloads must use a tag at or above `FIRST_APPLICATION_TAG`.
    #[error("application kind {0} collides with a core message tag")]
    ReservedKind(u32),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] bincode::Error),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl ProtocolError {
    /// True for a read that timed out with the stream otherwise healthy.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}
