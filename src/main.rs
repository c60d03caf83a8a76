use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use relaybot::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "relaybot", version, about = "Chat bot for Twitch and a Discord IRC gateway")]
struct Args {
    /// Configuration file (.yaml, .json or .toml)
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    info!("Starting relaybot v{}", relaybot::VERSION);

    let config = BotConfig::load(&args.config).await?;

    let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(config.queues.inbound_capacity);
    let outbound_capacity = config.queues.outbound_capacity;

    let mut connections = vec![spawn_connection(
        Arc::new(TwitchConnection::new(config.twitch_config())),
        inbound_tx.clone(),
        outbound_capacity,
    )];
    if let Some(gateway) = config.gateway_config() {
        connections.push(spawn_connection(
            Arc::new(GatewayConnection::new(gateway)),
            inbound_tx.clone(),
            outbound_capacity,
        ));
    }
    drop(inbound_tx);

    let features = Features::new(config.feature_settings(), Box::new(MemoryMailbox::new()));
    let mut bot = Bot::new(config.bot_settings(), connections, inbound_rx, features);
    Features::install(&mut bot)?;

    tokio::select! {
        result = bot.run() => {
            if let Err(e) = &result {
                error!("Dispatcher stopped with error: {:#}", e);
            }
            result
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received, stopping");
            Ok(())
        }
    }
}
