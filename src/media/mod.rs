#![forbid(unsafe_code)]

// Media module - the boundary to the external media-forwarding engine.
// The signaling layer only sees the handle traits below; mediasoup and the
// in-process engine both implement them.

pub mod config;
pub mod memory;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;
pub mod types;
#[cfg(feature = "mediasoup")]
pub mod worker_manager;

pub use config::{EngineKind, MediaConfig, WorkerConfig};
pub use memory::InMemoryEngine;
pub use types::{
    ConsumerInfo, EngineFault, MediaError, MediaKind, MediaResult, ProducerInfo,
    TransportDirection, TransportInfo,
};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Entry point into a media engine: hands out one router per room.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a router (the room's negotiation-capability handle)
    async fn create_router(&self) -> MediaResult<Box<dyn RouterHandle>>;

    /// Subscribes to unrecoverable engine faults
    fn subscribe_faults(&self) -> broadcast::Receiver<EngineFault>;
}

/// A router owned exclusively by one room.
#[async_trait]
pub trait RouterHandle: Send + Sync {
    fn id(&self) -> String;

    /// RTP capabilities clients load into their device before creating transports
    fn rtp_capabilities(&self) -> Value;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(&self) -> MediaResult<Box<dyn TransportHandle>>;

    /// Closes the router and everything created on it
    fn close(self: Box<Self>);
}

#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> String;

    fn info(&self) -> TransportInfo;

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Box<dyn ProducerHandle>>;

    /// Creates a consumer for `producer_id`. Consumers always start paused.
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<Box<dyn ConsumerHandle>>;

    fn close(self: Box<Self>);
}

pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn close(self: Box<Self>);
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;

    /// Unpauses the consumer. Resuming an active consumer succeeds.
    async fn resume(&self) -> MediaResult<()>;

    fn close(self: Box<Self>);
}

/// Starts the configured media engine
///
/// # Errors
/// Returns an error if the engine cannot be started (e.g. worker spawn failure)
pub async fn connect_engine(config: &MediaConfig) -> anyhow::Result<Arc<dyn MediaEngine>> {
    match config.engine {
        EngineKind::Memory => {
            warn!("Using in-memory media engine: signaling works, no media is forwarded");
            Ok(Arc::new(InMemoryEngine::new()))
        }
        #[cfg(feature = "mediasoup")]
        EngineKind::Mediasoup => {
            info!(
                "Starting mediasoup engine with {} workers",
                config.worker_config.num_workers
            );
            let engine = mediasoup_engine::MediasoupEngine::new(config.clone()).await?;
            Ok(Arc::new(engine))
        }
        #[cfg(not(feature = "mediasoup"))]
        EngineKind::Mediasoup => {
            info!("MEDIA_ENGINE=mediasoup requested");
            anyhow::bail!("This build has no mediasoup support; rebuild with `--features mediasoup`")
        }
    }
}
