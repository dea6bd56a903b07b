// CLI entry point for the standalone tandem relay.
//
// Usage:
//   relay [OPTIONS]
//     --config <FILE>            TOML config file (optional)
//     --port <PORT>              Listen port (default: 14455)
//     --bind <ADDR>              Listen address (default: 0.0.0.0)
//     --host-interval-ms <MS>    Host rotation interval (default: 15000)
//
// Command-line flags override the config file. Logging goes through
// `env_logger` (`RUST_LOG`, default `info`). Typing `stop` or `quit` on stdin
// shuts the relay down cleanly; otherwise it runs until the process is killed.

use std::error::Error;
use std::io::{self, BufRead};
use std::path::PathBuf;

use clap::Parser;
use log::info;
use tandem_relay::{RelayConfig, start_relay};

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Standalone tandem session relay")]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Host rotation interval in milliseconds
    #[arg(long)]
    host_interval_ms: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(interval) = self.host_interval_ms {
            config.host_rotation_interval_ms = interval;
        }
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    let (handle, addr) = start_relay(config)?;
    info!("relay ready on {addr}; type `stop` to shut down");

    wait_for_stop_command();
    info!("shutting down");
    handle.stop();
    Ok(())
}

/// Block until `stop`/`quit` arrives on stdin. If stdin is closed (running
/// detached), block forever.
fn wait_for_stop_command() {
    for line in io::stdin().lock().lines() {
        match line {
            Ok(line) if matches!(line.trim(), "stop" | "quit") => return,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    loop {
        std::thread::park();
    }
}
