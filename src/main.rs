//! Wayfarer Game Server
//!
//! Binds the listener, serves the built-in world map and shuts down
//! cleanly on Ctrl-C.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wayfarer::{
    network::{GameServer, ServerConfig},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Wayfarer Server v{}", VERSION);

    let config = ServerConfig::from_env()?;
    let world = &config.world;
    info!(
        "Tile work {:?}, cooldown {:?}, fight radius {}, round every {:?}",
        world.tile_work_time, world.tile_cooldown_time, world.fight_radius, world.fight_round_interval
    );

    let server = Arc::new(GameServer::bind(config).await?);

    let signal = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await?;
    // Give sessions a moment to flush their quit notices.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("Server stopped");
    Ok(())
}
