#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use sfu_signaling::config::ServerConfig;
use sfu_signaling::media;
use sfu_signaling::metrics::ServerMetrics;
use sfu_signaling::room::RoomManager;
use sfu_signaling::signaling::SignalingServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_signaling=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("SFU signaling server - starting");

    let config = ServerConfig::from_env()?;
    match config.media.announced_ip {
        Some(ip) => info!("Using ANNOUNCE_IP={}", ip),
        None => info!("No ANNOUNCE_IP set, ICE candidates use the listen address"),
    }

    let engine = media::connect_engine(&config.media).await?;
    let mut faults = engine.subscribe_faults();

    let metrics = ServerMetrics::new();
    let room_manager = Arc::new(RoomManager::new(engine, metrics.clone()));
    info!("Room manager and media engine initialized");

    let signaling_server = SignalingServer::new(room_manager.clone(), metrics, &config);
    info!("Starting signaling server on port {}", config.port);

    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                error!("Signaling server error: {}", e);
                return Err(e);
            }
        }
        fault = faults.recv() => {
            let reason = match fault {
                Ok(fault) => fault.to_string(),
                Err(e) => format!("fault channel failed: {e}"),
            };
            error!("Media engine failure, exiting: {}", reason);
            return Err(anyhow!("media engine failure: {reason}"));
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            room_manager.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
