#![forbid(unsafe_code)]

// Signaling errors - everything a handler can report back to the causing connection

use crate::media::MediaError;
use std::fmt;
use thiserror::Error;

/// Kind of room resource named in a `NotFound` error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Room,
    Transport,
    Producer,
    Consumer,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Room,
        ResourceKind::Transport,
        ResourceKind::Producer,
        ResourceKind::Consumer,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Room => f.write_str("room"),
            ResourceKind::Transport => f.write_str("transport"),
            ResourceKind::Producer => f.write_str("producer"),
            ResourceKind::Consumer => f.write_str("consumer"),
        }
    }
}

/// Message-level protocol violations. None of them close the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Not joined to a room")]
    NotJoined,

    #[error("Already joined to room {0}")]
    AlreadyJoined(String),

    #[error("Room {requested} does not match joined room {joined}")]
    RoomMismatch { requested: String, joined: String },

    #[error("Transport {transport_id} is a {actual} transport")]
    WrongDirection { transport_id: String, actual: String },

    #[error("Binary frames are not supported")]
    BinaryFrame,
}

/// Error returned by room and resource operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error("Incompatible capabilities: {0}")]
    Incompatible(String),

    #[error("Media engine failure: {0}")]
    EngineFailure(String),
}

impl SignalError {
    /// Every value `code()` can return
    pub const CODES: [&'static str; 4] = ["protocol", "not-found", "incompatible", "engine-failure"];

    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        SignalError::NotFound { kind, id: id.into() }
    }

    /// Machine-readable code carried in the `error` message
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::Protocol(_) => "protocol",
            SignalError::NotFound { .. } => "not-found",
            SignalError::Incompatible(_) => "incompatible",
            SignalError::EngineFailure(_) => "engine-failure",
        }
    }
}

impl From<MediaError> for SignalError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::Incompatible(reason) => SignalError::Incompatible(reason),
            other => SignalError::EngineFailure(other.to_string()),
        }
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
