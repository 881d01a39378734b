#![forbid(unsafe_code)]

// SFU signaling library - room/session lifecycle and signaling for a selective forwarding unit

pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
