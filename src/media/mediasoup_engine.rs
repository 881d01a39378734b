#![forbid(unsafe_code)]

// mediasoup-backed media engine

use super::worker_manager::WorkerManager;
use super::{
    ConsumerHandle, EngineFault, MediaConfig, MediaEngine, MediaError, MediaKind, MediaResult,
    ProducerHandle, RouterHandle, TransportHandle, TransportInfo,
};
use async_trait::async_trait;
use mediasoup::prelude::*;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Media engine that hosts rooms on a pool of mediasoup workers
pub struct MediasoupEngine {
    workers: WorkerManager,
    config: Arc<MediaConfig>,
}

impl MediasoupEngine {
    /// # Errors
    /// Returns an error if the worker pool cannot be started
    pub async fn new(config: MediaConfig) -> MediaResult<Self> {
        let (faults, _) = broadcast::channel(16);
        let workers = WorkerManager::new(&config.worker_config, faults).await?;
        Ok(Self {
            workers,
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(&self) -> MediaResult<Box<dyn RouterHandle>> {
        let (worker, load) = self.workers.get_least_loaded_worker().await?;

        let router = worker
            .create_router(RouterOptions::new(default_codecs()))
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;
        load.fetch_add(1, Ordering::Relaxed);

        info!("Created router {} on worker {}", router.id(), worker.id());
        Ok(Box::new(MediasoupRouter {
            router,
            load,
            config: self.config.clone(),
        }))
    }

    fn subscribe_faults(&self) -> broadcast::Receiver<EngineFault> {
        self.workers.subscribe_faults()
    }
}

struct MediasoupRouter {
    router: Router,
    load: Arc<AtomicUsize>,
    config: Arc<MediaConfig>,
}

impl MediasoupRouter {
    fn listen_info(&self) -> ListenInfo {
        let worker = &self.config.worker_config;
        ListenInfo {
            protocol: Protocol::Udp,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: self.config.announced_ip.map(|ip| ip.to_string()),
            expose_internal_ip: false,
            port: None,
            port_range: Some(worker.rtc_min_port..=worker.rtc_max_port),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

#[async_trait]
impl RouterHandle for MediasoupRouter {
    fn id(&self) -> String {
        self.router.id().to_string()
    }

    fn rtp_capabilities(&self) -> Value {
        serde_json::to_value(self.router.rtp_capabilities()).unwrap_or_default()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        let Ok(caps) = serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) else {
            return false;
        };
        self.router.can_consume(&producer_id, &caps)
    }

    async fn create_webrtc_transport(&self) -> MediaResult<Box<dyn TransportHandle>> {
        let mut options = WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(
            self.listen_info(),
        ));
        options.enable_udp = true;
        options.enable_tcp = true;
        options.prefer_udp = true;

        let transport = self
            .router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create transport: {e}")))?;

        debug!("Created transport {} on router {}", transport.id(), self.router.id());
        Ok(Box::new(MediasoupTransport { transport }))
    }

    fn close(self: Box<Self>) {
        // the worker closes the router once the last handle is dropped
        self.load.fetch_sub(1, Ordering::Relaxed);
        debug!("Closing router {}", self.router.id());
    }
}

struct MediasoupTransport {
    transport: WebRtcTransport,
}

#[async_trait]
impl TransportHandle for MediasoupTransport {
    fn id(&self) -> String {
        self.transport.id().to_string()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.transport.id().to_string(),
            ice_parameters: serde_json::to_value(self.transport.ice_parameters())
                .unwrap_or_default(),
            ice_candidates: serde_json::to_value(self.transport.ice_candidates())
                .unwrap_or_default(),
            dtls_parameters: serde_json::to_value(self.transport.dtls_parameters())
                .unwrap_or_default(),
        }
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters = serde_json::from_value(dtls_parameters)
            .map_err(|e| MediaError::TransportError(format!("Invalid dtlsParameters: {e}")))?;

        self.transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Box<dyn ProducerHandle>> {
        let rtp_parameters: RtpParameters = serde_json::from_value(rtp_parameters)
            .map_err(|e| MediaError::ProducerError(format!("Invalid rtpParameters: {e}")))?;

        let producer = self
            .transport
            .produce(ProducerOptions::new(to_mediasoup_kind(kind), rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        Ok(Box::new(MediasoupProducer { producer }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<Box<dyn ConsumerHandle>> {
        let producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::ConsumerError(format!("Invalid producer id: {producer_id}")))?;
        let rtp_capabilities: RtpCapabilities = serde_json::from_value(rtp_capabilities)
            .map_err(|e| MediaError::Incompatible(format!("Invalid rtpCapabilities: {e}")))?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;

        let consumer = self
            .transport
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        Ok(Box::new(MediasoupConsumer { consumer }))
    }

    fn close(self: Box<Self>) {
        debug!("Closing transport {}", self.transport.id());
    }
}

struct MediasoupProducer {
    producer: Producer,
}

impl ProducerHandle for MediasoupProducer {
    fn id(&self) -> String {
        self.producer.id().to_string()
    }

    fn kind(&self) -> MediaKind {
        from_mediasoup_kind(self.producer.kind())
    }

    fn close(self: Box<Self>) {
        debug!("Closing producer {}", self.producer.id());
    }
}

struct MediasoupConsumer {
    consumer: Consumer,
}

#[async_trait]
impl ConsumerHandle for MediasoupConsumer {
    fn id(&self) -> String {
        self.consumer.id().to_string()
    }

    fn kind(&self) -> MediaKind {
        from_mediasoup_kind(self.consumer.kind())
    }

    fn rtp_parameters(&self) -> Value {
        serde_json::to_value(self.consumer.rtp_parameters()).unwrap_or_default()
    }

    async fn resume(&self) -> MediaResult<()> {
        self.consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))
    }

    fn close(self: Box<Self>) {
        debug!("Closing consumer {}", self.consumer.id());
    }
}

fn to_mediasoup_kind(kind: MediaKind) -> mediasoup::rtp_parameters::MediaKind {
    match kind {
        MediaKind::Audio => mediasoup::rtp_parameters::MediaKind::Audio,
        MediaKind::Video => mediasoup::rtp_parameters::MediaKind::Video,
    }
}

fn from_mediasoup_kind(kind: mediasoup::rtp_parameters::MediaKind) -> MediaKind {
    match kind {
        mediasoup::rtp_parameters::MediaKind::Audio => MediaKind::Audio,
        mediasoup::rtp_parameters::MediaKind::Video => MediaKind::Video,
    }
}

const OPUS_CLOCK_RATE: NonZeroU32 = NonZeroU32::MIN.saturating_add(47_999);
const VIDEO_CLOCK_RATE: NonZeroU32 = NonZeroU32::MIN.saturating_add(89_999);
const STEREO: NonZeroU8 = NonZeroU8::MIN.saturating_add(1);

fn video_feedback() -> Vec<RtcpFeedback> {
    vec![
        RtcpFeedback::Nack,
        RtcpFeedback::NackPli,
        RtcpFeedback::CcmFir,
        RtcpFeedback::GoogRemb,
        RtcpFeedback::TransportCc,
    ]
}

/// Codecs every room router supports: opus, VP8, VP9 and H264
fn default_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: OPUS_CLOCK_RATE,
            channels: STEREO,
            parameters: RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
            ]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: Some(96),
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp9,
            preferred_payload_type: Some(98),
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(102),
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: video_feedback(),
        },
    ]
}
