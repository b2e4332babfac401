use anyhow::{Context, Result};
use partyline::TransportConfig;

use crate::Args;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub bind: String,
    pub name: String,
    pub tick_rate: u32,
    pub transport: TransportConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            name: "host".to_string(),
            tick_rate: 60,
            transport: TransportConfig::default(),
        }
    }
}

impl HostConfig {
    /// Defaults, then the optional TOML file, then whatever flags were given.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut transport = match &args.config {
            Some(path) => TransportConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TransportConfig::default(),
        };

        if let Some(port) = args.port {
            transport.port = port;
        }
        if let Some(ms) = args.heartbeat_ms {
            transport.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = args.ack_timeout_ms {
            transport.ack_timeout_ms = ms;
        }
        if let Some(retries) = args.max_retries {
            transport.max_retries = retries;
        }
        if let Some(missed) = args.max_missed {
            transport.max_missed_heartbeats = missed;
        }
        if let Some(window) = args.dedup_window {
            transport.dedup_window = window;
        }
        if let Some(max_peers) = args.max_peers {
            transport.max_peers = max_peers;
        }
        if !args.relay.is_empty() {
            transport.relay_kinds = args.relay.clone();
        }
        if let Some(loss) = args.loss_percent {
            transport.loss_percent = loss;
        }

        transport.validate()?;

        if args.tick_rate == 0 {
            anyhow::bail!("tick rate must be > 0");
        }

        Ok(Self {
            bind: args.bind.clone(),
            name: args.name.clone(),
            tick_rate: args.tick_rate,
            transport,
        })
    }
}
