use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{Context, Result};
use partyline::TransportConfig;

use crate::Args;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: SocketAddr,
    pub bind: String,
    pub name: String,
    pub tick_rate: u32,
    pub transport: TransportConfig,
}

impl ClientConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut transport = match &args.config {
            Some(path) => TransportConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TransportConfig::default(),
        };

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
        if let Some(loss) = args.loss_percent {
            transport.loss_percent = loss;
        }
        transport.validate()?;

        let host = resolve_host(&args.server, transport.port)?;
        let name = args.name.trim().to_string();
        if name.is_empty() {
            anyhow::bail!("display name must not be empty");
        }
        if args.tick_rate == 0 {
            anyhow::bail!("tick rate must be > 0");
        }

        Ok(Self {
            host,
            bind: args.bind.clone(),
            name,
            tick_rate: args.tick_rate,
            transport,
        })
    }
}

/// Accepts `ip:port`, `name:port`, or a bare address that gets the configured port.
fn resolve_host(server: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let with_port = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, default_port)
    };

    with_port
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", server))?
        .next()
        .with_context(|| format!("no address found for {}", server))
}
