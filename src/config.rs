#![forbid(unsafe_code)]

// Server configuration loaded from the environment

use crate::media::config::parse_env;
use crate::media::MediaConfig;
use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
    /// Bearer token required by `/metrics` when set
    pub metrics_token: Option<String>,
    pub media: MediaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            metrics_token: None,
            media: MediaConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads `PORT`, `MAX_CONNECTIONS`, `HEARTBEAT_INTERVAL_SECS`, `METRICS_TOKEN`
    /// and the media engine settings.
    ///
    /// # Errors
    /// Returns an error when a variable is set but cannot be parsed
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            media: MediaConfig::from_env()?,
            ..Self::default()
        };

        if let Some(port) = parse_env::<u16>("PORT")? {
            config.port = port;
        }

        if let Some(max) = parse_env::<usize>("MAX_CONNECTIONS")? {
            if max == 0 {
                warn!(
                    "MAX_CONNECTIONS=0 would reject all connections, using default {}",
                    DEFAULT_MAX_CONNECTIONS
                );
            } else {
                config.max_connections = max;
            }
        }
        info!("Max connections: {}", config.max_connections);

        if let Some(secs) = parse_env::<u64>("HEARTBEAT_INTERVAL_SECS")? {
            if secs == 0 {
                warn!(
                    "HEARTBEAT_INTERVAL_SECS=0 is not a valid interval, using default {}",
                    DEFAULT_HEARTBEAT_SECS
                );
            } else {
                config.heartbeat_interval = Duration::from_secs(secs);
            }
        }

        config.metrics_token = std::env::var("METRICS_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());
        if config.metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is unauthenticated");
        }

        Ok(config)
    }
}
