// tandem_relay: the session relay.
//
// The relay is a thin message broker: peers connect over TCP, announce an id,
// and everything they send is fanned out to the other bound peers (or to the
// listed destinations). The relay answers clock-sync and host queries itself,
// designates one bound peer as host and rotates that role on a timer, and
// announces departures on behalf of peers whose sockets close.
//
// Module overview:
// - `bindings.rs`: Connection ↔ peer-id maps and host selection. Pure
//                  bookkeeping, no I/O; `server.rs` acts on its outcomes.
// - `server.rs`:   TCP listener, per-connection service and writer threads,
//                  routing, keepalive, host rotation timer, shutdown.
// - `config.rs`:   `RelayConfig` (serde/TOML with defaults).
// - `error.rs`:    `RelayError`.
//
// Dependencies: `tandem_protocol` for framing and envelopes. No dependency on
// the client crate.
//
// The relay runs as a standalone binary (`main.rs`) or embedded in another
// process via `start_relay` / `RelayServer`.

pub mod bindings;
pub mod config;
pub mod error;
pub mod server;

pub use config::RelayConfig;
pub use error::RelayError;
pub use server::{RelayHandle, RelayServer, start_relay};
