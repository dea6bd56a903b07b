// Relay configuration: defaults, optional TOML file, CLI overrides (in
// `main.rs`).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Interface to listen on (default 0.0.0.0).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Listen port (default 14455; 0 lets the OS pick).
    #[serde(default = "default_port")]
    pub port: u16,
    /// How often a new host is drawn from the bound peers.
    #[serde(default = "default_host_rotation_interval_ms")]
    pub host_rotation_interval_ms: u64,
    /// Read-idle time after which the relay sends a heartbeat to a client.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Realtime envelopes older than this are dropped on ingress.
    #[serde(default = "default_realtime_timeout_ms")]
    pub realtime_timeout_ms: u64,
    /// At most one stale-drop log line per message kind and connection per
    /// interval.
    #[serde(default = "default_drop_log_interval_ms")]
    pub drop_log_interval_ms: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    14455
}
fn default_host_rotation_interval_ms() -> u64 {
    15_000
}
fn default_keepalive_interval_ms() -> u64 {
    3000
}
fn default_realtime_timeout_ms() -> u64 {
    1000
}
fn default_drop_log_interval_ms() -> u64 {
    1000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            host_rotation_interval_ms: default_host_rotation_interval_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            realtime_timeout_ms: default_realtime_timeout_ms(),
            drop_log_interval_ms: default_drop_log_interval_ms(),
        }
    }
}

impl RelayConfig {
    /// Loopback relay on an OS-assigned port.
    pub fn local_ephemeral() -> Self {
        Self {
            bind_address: "127.0.0.1".into(),
            port: 0,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, RelayError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path).map_err(|source| RelayError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn host_rotation_interval(&self) -> Duration {
        Duration::from_millis(self.host_rotation_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn drop_log_interval(&self) -> Duration {
        Duration::from_millis(self.drop_log_interval_ms)
    }

    pub fn realtime_timeout_ms(&self) -> i64 {
        i64::try_from(self.realtime_timeout_ms).unwrap_or(i64::MAX)
    }
}
