use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lora_join_server::config::Config;
use lora_join_server::registry::InMemoryRegistry;
use lora_join_server::server::JoinListener;

#[derive(Parser)]
#[command(name = "lora-join-server")]
#[command(about = "LoRaWAN join server answering roaming JoinReqs from network servers")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {:#}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-join-server v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(InMemoryRegistry::from_records(config.device_records()?));
    info!(
        "{} device(s), {} peer(s), serving {} JoinEUI(s)",
        registry.device_count().await,
        config.peers.len(),
        config.join_server.join_euis.len()
    );
    let server = Arc::new(config.join_server(registry)?);

    let listener = JoinListener::from_config(&config, server)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener_task = tokio::spawn(listener.run(shutdown_rx));

    info!("Join server running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown_tx.send(true).ok();
    match listener_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Listener failed: {:#}", e),
        Err(e) => error!("Listener task panicked: {}", e),
    }

    Ok(())
}
