#![forbid(unsafe_code)]

// In-process media engine.
//
// Allocates ids, hands out negotiation parameters and performs codec
// matching for consume requests, but never opens sockets or forwards RTP.
// The test suite drives the signaling layer against it, and MEDIA_ENGINE=memory
// runs the server for signaling-only development.

use super::types::{EngineFault, MediaError, MediaKind, MediaResult, TransportInfo};
use super::{ConsumerHandle, MediaEngine, ProducerHandle, RouterHandle, TransportHandle};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Engine-wide counters and fault injection switches
struct EngineState {
    routers_created: AtomicUsize,
    routers_closed: AtomicUsize,
    transports_open: AtomicUsize,
    producers_open: AtomicUsize,
    consumers_open: AtomicUsize,
    fail_router_creation: AtomicBool,
    fail_transport_creation: AtomicBool,
    router_delay_ms: AtomicU64,
    next_port: AtomicU16,
    faults: broadcast::Sender<EngineFault>,
}

/// Producers registered on one router, for consume lookups
#[derive(Default)]
struct RouterState {
    producers: HashMap<String, ProducerRecord>,
    closed: bool,
}

struct ProducerRecord {
    kind: MediaKind,
    mime_types: Vec<String>,
    rtp_parameters: Value,
}

/// Media engine that lives entirely inside the process
#[derive(Clone)]
pub struct InMemoryEngine {
    state: Arc<EngineState>,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    pub fn new() -> Self {
        let (faults, _) = broadcast::channel(8);
        Self {
            state: Arc::new(EngineState {
                routers_created: AtomicUsize::new(0),
                routers_closed: AtomicUsize::new(0),
                transports_open: AtomicUsize::new(0),
                producers_open: AtomicUsize::new(0),
                consumers_open: AtomicUsize::new(0),
                fail_router_creation: AtomicBool::new(false),
                fail_transport_creation: AtomicBool::new(false),
                router_delay_ms: AtomicU64::new(0),
                next_port: AtomicU16::new(40000),
                faults,
            }),
        }
    }

    pub fn routers_created(&self) -> usize {
        self.state.routers_created.load(Ordering::SeqCst)
    }

    pub fn routers_closed(&self) -> usize {
        self.state.routers_closed.load(Ordering::SeqCst)
    }

    pub fn transports_open(&self) -> usize {
        self.state.transports_open.load(Ordering::SeqCst)
    }

    pub fn producers_open(&self) -> usize {
        self.state.producers_open.load(Ordering::SeqCst)
    }

    pub fn consumers_open(&self) -> usize {
        self.state.consumers_open.load(Ordering::SeqCst)
    }

    /// Makes subsequent router creations fail
    pub fn set_fail_router_creation(&self, fail: bool) {
        self.state.fail_router_creation.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent transport creations fail
    pub fn set_fail_transport_creation(&self, fail: bool) {
        self.state.fail_transport_creation.store(fail, Ordering::SeqCst);
    }

    /// Delays router creation, widening the window for concurrent joins
    pub fn set_router_delay(&self, delay: Duration) {
        self.state
            .router_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Publishes a worker-death fault, as a crashed engine process would
    pub fn simulate_worker_death(&self, reason: &str) {
        warn!("Simulating media worker death: {}", reason);
        let _ = self.state.faults.send(EngineFault {
            worker_id: "memory-0".to_string(),
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl MediaEngine for InMemoryEngine {
    async fn create_router(&self) -> MediaResult<Box<dyn RouterHandle>> {
        let delay = self.state.router_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_router_creation.load(Ordering::SeqCst) {
            return Err(MediaError::RouterError(
                "Failed to create router: worker rejected request".to_string(),
            ));
        }

        self.state.routers_created.fetch_add(1, Ordering::SeqCst);
        let router = MemoryRouter {
            id: Uuid::new_v4().to_string(),
            engine: self.state.clone(),
            state: Arc::new(Mutex::new(RouterState::default())),
        };
        debug!("Created in-memory router {}", router.id);
        Ok(Box::new(router))
    }

    fn subscribe_faults(&self) -> broadcast::Receiver<EngineFault> {
        self.state.faults.subscribe()
    }
}

/// Default router capabilities: Opus, VP8 and H264
pub fn default_rtp_capabilities() -> Value {
    json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 111,
                "clockRate": 48000,
                "channels": 2,
                "parameters": { "minptime": 10, "useinbandfec": 1 },
                "rtcpFeedback": [{ "type": "transport-cc", "parameter": "" }]
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 96,
                "clockRate": 90000,
                "parameters": {},
                "rtcpFeedback": [
                    { "type": "nack", "parameter": "" },
                    { "type": "nack", "parameter": "pli" },
                    { "type": "ccm", "parameter": "fir" },
                    { "type": "goog-remb", "parameter": "" },
                    { "type": "transport-cc", "parameter": "" }
                ]
            },
            {
                "kind": "video",
                "mimeType": "video/H264",
                "preferredPayloadType": 102,
                "clockRate": 90000,
                "parameters": {
                    "level-asymmetry-allowed": 1,
                    "packetization-mode": 1,
                    "profile-level-id": "42e01f"
                },
                "rtcpFeedback": [
                    { "type": "nack", "parameter": "" },
                    { "type": "nack", "parameter": "pli" },
                    { "type": "transport-cc", "parameter": "" }
                ]
            }
        ],
        "headerExtensions": []
    })
}

fn lock_router(state: &Mutex<RouterState>) -> std::sync::MutexGuard<'_, RouterState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Lower-cased mime types declared in `rtpParameters.codecs`
fn declared_mime_types(rtp_parameters: &Value) -> Vec<String> {
    rtp_parameters
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                .map(str::to_ascii_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

fn capabilities_match(record: &ProducerRecord, rtp_capabilities: &Value) -> bool {
    let Some(codecs) = rtp_capabilities.get("codecs").and_then(Value::as_array) else {
        return false;
    };
    let kind = record.kind.to_string();
    codecs.iter().any(|codec| {
        let mime = codec
            .get("mimeType")
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase);
        if record.mime_types.is_empty() {
            codec.get("kind").and_then(Value::as_str) == Some(kind.as_str())
        } else {
            mime.is_some_and(|m| record.mime_types.contains(&m))
        }
    })
}

struct MemoryRouter {
    id: String,
    engine: Arc<EngineState>,
    state: Arc<Mutex<RouterState>>,
}

#[async_trait]
impl RouterHandle for MemoryRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        default_rtp_capabilities()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let state = lock_router(&self.state);
        state
            .producers
            .get(producer_id)
            .is_some_and(|record| capabilities_match(record, rtp_capabilities))
    }

    async fn create_webrtc_transport(&self) -> MediaResult<Box<dyn TransportHandle>> {
        if self.engine.fail_transport_creation.load(Ordering::SeqCst) {
            return Err(MediaError::TransportError(
                "Failed to create transport: no ports available".to_string(),
            ));
        }
        if lock_router(&self.state).closed {
            return Err(MediaError::RouterError(format!("Router {} is closed", self.id)));
        }

        let id = Uuid::new_v4().to_string();
        let port = self.engine.next_port.fetch_add(1, Ordering::SeqCst);
        let info = TransportInfo {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "priority": 1076302079u32,
                "address": "127.0.0.1",
                "ip": "127.0.0.1",
                "protocol": "udp",
                "port": port,
                "type": "host"
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": Uuid::new_v4().simple().to_string()
                }]
            }),
        };

        self.engine.transports_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransport {
            id,
            info,
            connected: AtomicBool::new(false),
            engine: self.engine.clone(),
            router: self.state.clone(),
        }))
    }

    fn close(self: Box<Self>) {
        let mut state = lock_router(&self.state);
        if !state.closed {
            state.closed = true;
            state.producers.clear();
            self.engine.routers_closed.fetch_add(1, Ordering::SeqCst);
            debug!("Closed in-memory router {}", self.id);
        }
    }
}

struct MemoryTransport {
    id: String,
    info: TransportInfo,
    connected: AtomicBool,
    engine: Arc<EngineState>,
    router: Arc<Mutex<RouterState>>,
}

#[async_trait]
impl TransportHandle for MemoryTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        self.info.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        let has_fingerprints = dtls_parameters
            .get("fingerprints")
            .is_some_and(Value::is_array);
        if !has_fingerprints {
            return Err(MediaError::TransportError(
                "Invalid dtlsParameters: missing fingerprints".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(MediaError::TransportError(format!(
                "Transport {} already connected",
                self.id
            )));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Box<dyn ProducerHandle>> {
        if !rtp_parameters.is_object() {
            return Err(MediaError::ProducerError(
                "Invalid rtpParameters: expected an object".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        {
            let mut router = lock_router(&self.router);
            if router.closed {
                return Err(MediaError::ProducerError("Router closed".to_string()));
            }
            router.producers.insert(
                id.clone(),
                ProducerRecord {
                    kind,
                    mime_types: declared_mime_types(&rtp_parameters),
                    rtp_parameters,
                },
            );
        }

        self.engine.producers_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryProducer {
            id,
            kind,
            engine: self.engine.clone(),
            router: self.router.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<Box<dyn ConsumerHandle>> {
        let (kind, rtp_parameters) = {
            let router = lock_router(&self.router);
            let record = router.producers.get(producer_id).ok_or_else(|| {
                MediaError::ConsumerError(format!("Producer not found: {producer_id}"))
            })?;
            if !capabilities_match(record, &rtp_capabilities) {
                return Err(MediaError::Incompatible(format!(
                    "no matching codec for {} producer {producer_id}",
                    record.kind
                )));
            }
            (record.kind, record.rtp_parameters.clone())
        };

        self.engine.consumers_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConsumer {
            id: Uuid::new_v4().to_string(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(true),
            engine: self.engine.clone(),
        }))
    }

    fn close(self: Box<Self>) {
        self.engine.transports_open.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryProducer {
    id: String,
    kind: MediaKind,
    engine: Arc<EngineState>,
    router: Arc<Mutex<RouterState>>,
}

impl ProducerHandle for MemoryProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(self: Box<Self>) {
        lock_router(&self.router).producers.remove(&self.id);
        self.engine.producers_open.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryConsumer {
    id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    paused: AtomicBool,
    engine: Arc<EngineState>,
}

#[async_trait]
impl ConsumerHandle for MemoryConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> MediaResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(self: Box<Self>) {
        self.engine.consumers_open.fetch_sub(1, Ordering::SeqCst);
    }
}
