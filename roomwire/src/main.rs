mod config;
mod logging;
mod server;
mod ws;

use anyhow::Result;
use clap::Parser;
use roomwire_sfu::{LocalEngine, MediaEngine, SignalingGateway};
use std::sync::Arc;
use tracing::info;

use config::Config;
use server::RoomwireServer;

/// Roomwire SFU signaling server
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "ROOMWIRE_CONFIG_PATH", default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(Some(&args.config))?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Roomwire server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Media engine and signaling gateway
    let engine: Arc<dyn MediaEngine> = Arc::new(LocalEngine::new());
    info!("Using in-process loopback media engine");
    let gateway = SignalingGateway::new(config.sfu.clone(), engine);

    // 5. Serve until shutdown
    RoomwireServer::new(config, gateway).start().await
}
