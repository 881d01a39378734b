#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Error type for media engine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    /// The viewer's RTP capabilities cannot receive the producer
    #[error("Cannot consume: {0}")]
    Incompatible(String),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Direction of a WebRTC transport, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// Transport negotiation parameters handed back to the client.
///
/// The ICE and DTLS blobs are opaque to the signaling layer; they are
/// produced by the engine and forwarded untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Producer descriptor as listed to viewers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub user_id: String,
    pub kind: MediaKind,
}

/// Consumer information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub paused: bool,
}

/// Unrecoverable engine event (a worker process died)
#[derive(Debug, Clone)]
pub struct EngineFault {
    pub worker_id: String,
    pub reason: String,
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "media worker {} terminated: {}", self.worker_id, self.reason)
    }
}
