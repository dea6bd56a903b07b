// Session configuration.
//
// Loaded in layers: defaults, then an optional TOML file, then environment
// overrides (`TANDEM_RELAY_ADDR`, `TANDEM_PEER_ID`, `TANDEM_PLAYER_NAME`).
// Every field has a serde default so a partial file is valid. An empty
// `peer_id` is replaced by a fresh v4 UUID.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const ENV_RELAY_ADDR: &str = "TANDEM_RELAY_ADDR";
pub const ENV_PEER_ID: &str = "TANDEM_PEER_ID";
pub const ENV_PLAYER_NAME: &str = "TANDEM_PLAYER_NAME";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// `host:port` of the relay (default localhost:14455).
    #[serde(default = "default_relay_addr")]
    pub relay_addr: String,
    /// Local peer id; random UUID when unset.
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
    /// Display name announced to other peers.
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Realtime envelopes older than this are dropped on dispatch.
    #[serde(default = "default_realtime_timeout_ms")]
    pub realtime_timeout_ms: u64,
    /// Minimum spacing between stale-drop log lines per message kind.
    #[serde(default = "default_drop_log_interval_ms")]
    pub drop_log_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Soft time budget of one `poll()`.
    #[serde(default = "default_poll_budget_ms")]
    pub poll_budget_ms: u64,
    /// Wait between a connection failure and the next attempt.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_relay_addr() -> String {
    "localhost:14455".into()
}
fn default_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_player_name() -> String {
    "player".into()
}
fn default_realtime_timeout_ms() -> u64 {
    1000
}
fn default_drop_log_interval_ms() -> u64 {
    1000
}
fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_poll_budget_ms() -> u64 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_addr: default_relay_addr(),
            peer_id: default_peer_id(),
            player_name: default_player_name(),
            realtime_timeout_ms: default_realtime_timeout_ms(),
            drop_log_interval_ms: default_drop_log_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            poll_budget_ms: default_poll_budget_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl SessionConfig {
    /// Defaults with the given relay address, peer id and display name.
    pub fn new(
        relay_addr: impl Into<String>,
        peer_id: impl Into<String>,
        player_name: impl Into<String>,
    ) -> Self {
        let mut config = Self {
            relay_addr: relay_addr.into(),
            peer_id: peer_id.into(),
            player_name: player_name.into(),
            ..Self::default()
        };
        config.fill_peer_id();
        config
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let mut config: SessionConfig = toml::from_str(s)?;
        config.fill_peer_id();
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Apply `TANDEM_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup(ENV_RELAY_ADDR) {
            self.relay_addr = addr;
        }
        if let Some(id) = lookup(ENV_PEER_ID) {
            self.peer_id = id;
        }
        if let Some(name) = lookup(ENV_PLAYER_NAME) {
            self.player_name = name;
        }
        self.fill_peer_id();
    }

    fn fill_peer_id(&mut self) {
        if self.peer_id.trim().is_empty() {
            self.peer_id = default_peer_id();
        }
    }

    pub fn realtime_timeout(&self) -> Duration {
        Duration::from_millis(self.realtime_timeout_ms)
    }

    pub fn drop_log_interval(&self) -> Duration {
        Duration::from_millis(self.drop_log_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_budget(&self) -> Duration {
        Duration::from_millis(self.poll_budget_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
