//! Scribble sync server.
//!
//! Serves shared drawing rooms over WebSocket. Configuration comes from
//! `SCRIBBLE_*` environment variables (see [`ServerConfig::from_env`]);
//! log output is controlled with `RUST_LOG`.

use log::info;
use scribble_collab::config::ServerConfig;
use scribble_collab::server::SyncServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting scribble server on {} (max {} per room)",
        config.bind_addr, config.max_participants_per_room
    );

    let server = SyncServer::new(config);
    server
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
        })
        .await?;

    let stats = server.stats().await;
    info!(
        "Server stopped after {} connections, {} messages",
        stats.total_connections, stats.total_messages
    );
    Ok(())
}
