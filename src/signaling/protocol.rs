#![forbid(unsafe_code)]

// Signaling protocol - JSON message types for WebSocket communication

use crate::error::ProtocolError;
use crate::media::{MediaKind, ProducerInfo, TransportDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Every inbound `type` the server understands, aliases included
pub const KNOWN_TYPES: &[&str] = &[
    "join-room",
    "get-rtp-capabilities",
    "get-capabilities",
    "create-send-transport",
    "create-recv-transport",
    "connect-transport",
    "produce",
    "get-producers",
    "consume",
    "resume-consumer",
    "leave-room",
];

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        is_viewer: bool,
    },
    #[serde(rename_all = "camelCase")]
    GetRtpCapabilities {
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateSendTransport {
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateRecvTransport {
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    GetProducers {
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        #[serde(default)]
        room_id: Option<String>,
    },
}

impl ClientMessage {
    /// Decodes one text frame.
    ///
    /// Unknown `type` values are reported separately from malformed payloads
    /// so the caller can ignore the former.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(format!("invalid JSON: {e}")))?;

        let msg_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing `type` field".to_string()))?
            .to_string();

        if !KNOWN_TYPES.contains(&msg_type.as_str()) {
            return Err(ProtocolError::UnknownType(msg_type));
        }
        if msg_type == "get-capabilities" {
            value["type"] = Value::from("get-rtp-capabilities");
        }

        serde_json::from_value(value)
            .map_err(|e| ProtocolError::Malformed(format!("invalid {msg_type} message: {e}")))
    }

    /// The room named by the message, if it names one
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinRoom { room_id, .. }
            | ClientMessage::GetRtpCapabilities { room_id }
            | ClientMessage::CreateSendTransport { room_id }
            | ClientMessage::CreateRecvTransport { room_id }
            | ClientMessage::GetProducers { room_id } => Some(room_id),
            ClientMessage::LeaveRoom { room_id } => room_id.as_deref(),
            ClientMessage::ConnectTransport { .. }
            | ClientMessage::Produce { .. }
            | ClientMessage::Consume { .. }
            | ClientMessage::ResumeConsumer { .. } => None,
        }
    }
}

/// Member entry in the `room-joined` user list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub is_viewer: bool,
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Join acknowledged, with the room's current members and producers
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        user_id: String,
        is_viewer: bool,
        users: Vec<UserInfo>,
        producers: Vec<ProducerInfo>,
    },
    #[serde(rename_all = "camelCase")]
    RtpCapabilities {
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        direction: TransportDirection,
        ice_parameters: Value,
        ice_candidates: Value,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected {
        transport_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Produced {
        producer_id: String,
    },
    Producers {
        producers: Vec<ProducerInfo>,
    },
    #[serde(rename_all = "camelCase")]
    Consumed {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed {
        consumer_id: String,
    },
    /// A producer appeared; sent to viewers only
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        user_id: String,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_id: String,
        is_viewer: bool,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        user_id: String,
    },
    Error {
        error: String,
        code: String,
    },
}

/// Item queued on a connection's outbound channel
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialized JSON, shared between fan-out recipients
    Text(Arc<String>),
    /// WebSocket ping from the heartbeat
    Ping,
}

impl Outbound {
    /// Serializes a message once so it can be cloned cheaply per recipient
    pub fn encode(message: &ServerMessage) -> Option<Self> {
        match serde_json::to_string(message) {
            Ok(json) => Some(Outbound::Text(Arc::new(json))),
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                None
            }
        }
    }
}
