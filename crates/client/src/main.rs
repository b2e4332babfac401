mod chat;
mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use chat::ChatClient;
use config::ClientConfig;

#[derive(Parser)]
#[command(name = "partyline-client")]
#[command(about = "Join a partyline session hosted on the local network")]
pub struct Args {
    #[arg(
        short,
        long,
        help = "Host address to join (e.g., 192.168.1.20 or 192.168.1.20:54322)"
    )]
    server: String,

    #[arg(short, long, help = "Display name shown to other players")]
    name: String,

    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

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

    #[arg(long, help = "Missed heartbeats before the host is considered gone")]
    max_missed: Option<u32>,

    #[arg(long)]
    dedup_window: Option<usize>,

    #[arg(long, help = "Outbound packet loss percentage (0-100)")]
    loss_percent: Option<f32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ClientConfig::from_args(&args)?;

    log::info!("Joining {} as '{}'", config.host, config.name);
    let mut client = ChatClient::new(config)?;
    client.run();

    Ok(())
}
