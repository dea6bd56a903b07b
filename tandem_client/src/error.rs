// Client error types: connection failures, config loading, and the
// session-ending `SessionError`.

use std::io;
use std::path::PathBuf;

use tandem_protocol::{PeerId, ProtocolVersion};
use thiserror::Error;

/// Failures of a single relay connection. All of them end up reported
/// through the connection's event callback as strings.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The relay address could not be resolved.
    #[error("invalid relay address {addr:?}: {reason}")]
    Configuration { addr: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("connection already destroyed")]
    Destroyed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Session-level failures that end the session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("peer {peer} speaks protocol {remote}, incompatible with local {local}")]
    IncompatiblePeer {
        peer: PeerId,
        remote: ProtocolVersion,
        local: ProtocolVersion,
    },
}
