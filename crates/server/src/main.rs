mod chat;
mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use chat::ChatHost;
use config::HostConfig;

#[derive(Parser)]
#[command(name = "partyline-host")]
#[command(about = "Host a partyline session on the local network")]
pub struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, help = "Listening port [default: 54322]")]
    port: Option<u16>,

    #[arg(short, long, default_value = "host", help = "Display name of the hosting player")]
    name: String,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, help = "TOML file with transport settings")]
    config: Option<PathBuf>,

    #[arg(long, help = "Heartbeat interval in ms")]
    heartbeat_ms: Option<u64>,

    #[arg(long, help = "Time to wait for an ACK before resending, in ms")]
    ack_timeout_ms: Option<u64>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long, help = "Missed heartbeats before a peer is dropped")]
    max_missed: Option<u32>,

    #[arg(long)]
    dedup_window: Option<usize>,

    #[arg(short, long)]
    max_peers: Option<usize>,

    #[arg(long, help = "Application kind to rebroadcast to every other peer (repeatable)")]
    relay: Vec<String>,

    #[arg(long, help = "Outbound packet loss percentage (0-100)")]
    loss_percent: Option<f32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = HostConfig::from_args(&args)?;

    let mut host = ChatHost::new(config)?;
    log::info!("Host started on {}, type /quit to stop", host.local_addr());

    host.run();

    log::info!("Host shutting down");
    Ok(())
}
