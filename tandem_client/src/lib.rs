// tandem_client: peer side of a tandem relay session.
//
// A peer process holds one `Communicator`, calls `update()` from its control
// loop, and plugs collaborators in as `SyncModule`s. Everything network-facing
// runs on background threads; handlers and registry observers fire on the
// control thread during `update()`.
//
// Module overview:
// - `config.rs`:       `SessionConfig` (TOML + `TANDEM_*` env overrides).
// - `connection.rs`:   `ClientConnection`: socket, receive/transmit threads,
//                      handler table, dispatch filter, `Outbox`.
// - `communicator.rs`: `Communicator`: session state machine, identity
//                      exchange, clock sync, heartbeats, reconnect, quit.
// - `registry.rs`:     `PeerRegistry` with add/rename/remove observers.
// - `sync.rs`:         `SyncModule` trait for collaborators.
// - `error.rs`:        `ConnectionError`, `ConfigError`, `SessionError`.
//
// Depends on `tandem_protocol` for the wire format and relay clock; never on
// the relay crate.

pub mod communicator;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod sync;

pub use communicator::{Communicator, SessionState};
pub use config::SessionConfig;
pub use connection::{ClientConnection, ConnectionEvent, ConnectionState, HandlerId, Outbox};
pub use error::{ConfigError, ConnectionError, SessionError};
pub use registry::{Peer, PeerEvent, PeerRegistry, SubscriptionId};
pub use sync::SyncModule;
