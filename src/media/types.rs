#![forbid(unsafe_code)]

// Types shared by every media engine implementation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Kind of media carried by a producer or consumer
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

/// Errors surfaced by a media engine
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

    /// The offered RTP parameters or capabilities are not supported by the router
    #[error("Unsupported media: {0}")]
    Unsupported(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Closed: {0}")]
    Closed(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// Parameters a client needs to set up its side of a WebRTC transport.
/// The ICE/DTLS blobs are opaque to everything but the engine and the client library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    #[serde(rename = "transportId")]
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}
