use clap::Parser;
use client::network::{Client, ClientConfig};
use log::info;
use rand::Rng;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Player name (random if omitted)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Delay before reconnecting after the connection drops, in milliseconds
    #[arg(long, default_value = "2000")]
    reconnect_delay_ms: u64,

    /// Updates buffered before the snapshot before giving up and reconnecting (0 = unbounded)
    #[arg(long, default_value = "4096")]
    max_pending: usize,

    /// Move the player randomly every this many milliseconds
    #[arg(short = 'b', long)]
    bot_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let name = args
        .name
        .unwrap_or_else(|| format!("player-{:04}", rand::thread_rng().gen_range(0..10_000)));

    let mut config = ClientConfig::new(args.server, name);
    config.reconnect_delay = Duration::from_millis(args.reconnect_delay_ms);
    config.max_pending = (args.max_pending > 0).then_some(args.max_pending);
    config.bot_interval = args.bot_interval_ms.map(Duration::from_millis);

    info!("Starting client {} -> {}", config.name, config.server);

    let mut client = Client::new(config);
    client.run().await?;

    info!("Client stopped after {} connections", client.connections());
    Ok(())
}
