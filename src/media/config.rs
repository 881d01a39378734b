#![forbid(unsafe_code)]

// Configuration for the media engine: which backend, worker pool, RTC ports

use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::str::FromStr;

/// Which media engine backs the signaling server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// mediasoup worker processes (requires the `mediasoup` feature)
    Mediasoup,
    /// In-process engine without media forwarding
    Memory,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mediasoup" => Ok(EngineKind::Mediasoup),
            "memory" => Ok(EngineKind::Memory),
            other => bail!("Unknown MEDIA_ENGINE: {other} (expected `mediasoup` or `memory`)"),
        }
    }
}

impl Default for EngineKind {
    fn default() -> Self {
        if cfg!(feature = "mediasoup") {
            EngineKind::Mediasoup
        } else {
            EngineKind::Memory
        }
    }
}

/// Main media engine configuration
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub engine: EngineKind,
    pub worker_config: WorkerConfig,
    /// Public address announced in ICE candidates
    pub announced_ip: Option<IpAddr>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            worker_config: WorkerConfig::default(),
            announced_ip: None,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_worker_count(),
            log_level: "warn".to_string(),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
        }
    }
}

#[cfg(feature = "mediasoup")]
fn default_worker_count() -> usize {
    num_cpus::get()
}

#[cfg(not(feature = "mediasoup"))]
fn default_worker_count() -> usize {
    1
}

impl MediaConfig {
    /// Loads media settings from `MEDIA_ENGINE`, `ANNOUNCE_IP`, `MEDIA_WORKERS`,
    /// `RTC_MIN_PORT`, `RTC_MAX_PORT` and `MEDIA_LOG_LEVEL`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(engine) = std::env::var("MEDIA_ENGINE") {
            config.engine = engine.parse()?;
        }

        if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
            let addr = ip
                .parse()
                .with_context(|| format!("Invalid ANNOUNCE_IP: {ip}"))?;
            config.announced_ip = Some(addr);
        }

        if let Some(n) = parse_env::<usize>("MEDIA_WORKERS")? {
            if n == 0 {
                bail!("MEDIA_WORKERS must be at least 1");
            }
            config.worker_config.num_workers = n;
        }

        if let Some(port) = parse_env::<u16>("RTC_MIN_PORT")? {
            config.worker_config.rtc_min_port = port;
        }
        if let Some(port) = parse_env::<u16>("RTC_MAX_PORT")? {
            config.worker_config.rtc_max_port = port;
        }
        if config.worker_config.rtc_min_port > config.worker_config.rtc_max_port {
            bail!(
                "RTC_MIN_PORT ({}) is above RTC_MAX_PORT ({})",
                config.worker_config.rtc_min_port,
                config.worker_config.rtc_max_port
            );
        }

        if let Ok(level) = std::env::var("MEDIA_LOG_LEVEL") {
            config.worker_config.log_level = level;
        }

        Ok(config)
    }
}

/// Reads and parses an optional environment variable
pub(crate) fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid {name}: {raw}")),
        Err(_) => Ok(None),
    }
}
