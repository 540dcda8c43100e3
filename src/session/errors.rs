#![forbid(unsafe_code)]

// Error taxonomy for session operations

use crate::media::MediaError;
use crate::signaling::protocol::{ErrorCode, ServerMessage};
use std::fmt;
use thiserror::Error;

/// Engine call that failed or timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    CreateRouter,
    CreateTransport,
    ConnectTransport,
    Produce,
    Consume,
    ResumeConsumer,
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineOp::CreateRouter => "createRouter",
            EngineOp::CreateTransport => "createTransport",
            EngineOp::ConnectTransport => "connectTransport",
            EngineOp::Produce => "produce",
            EngineOp::Consume => "consume",
            EngineOp::ResumeConsumer => "resumeConsumer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Room,
    Participant,
    Transport,
    Producer,
    Consumer,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Room => "room",
            Resource::Participant => "participant",
            Resource::Transport => "transport",
            Resource::Producer => "producer",
            Resource::Consumer => "consumer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: Resource, id: String },

    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error("Media engine failed during {op}: {reason}")]
    Engine { op: EngineOp, reason: String },

    #[error("Media engine timed out during {op}")]
    EngineTimeout { op: EngineOp },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Room is full: {0}")]
    RoomFull(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    pub fn not_found(resource: Resource, id: impl Into<String>) -> Self {
        SessionError::NotFound { resource, id: id.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SessionError::Validation(message.into())
    }

    /// Maps an engine failure for `op` onto the session taxonomy.
    pub fn from_media(op: EngineOp, error: MediaError) -> Self {
        match error {
            MediaError::Unsupported(reason) => SessionError::CapabilityMismatch(reason),
            MediaError::InvalidParameters(reason) => SessionError::Validation(reason),
            other => SessionError::Engine { op, reason: other.to_string() },
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Validation(_) => ErrorCode::ValidationError,
            SessionError::NotFound { .. } => ErrorCode::NotFound,
            SessionError::CapabilityMismatch(_) => ErrorCode::CapabilityMismatch,
            SessionError::Engine { .. } => ErrorCode::EngineError,
            SessionError::EngineTimeout { .. } => ErrorCode::EngineTimeout,
            SessionError::Conflict(_) => ErrorCode::Conflict,
            SessionError::RoomFull(_) => ErrorCode::RoomFull,
            SessionError::LimitExceeded(_) => ErrorCode::LimitExceeded,
        }
    }

    /// Whether the client may retry the same request unchanged.
    /// A connect that failed or timed out may have half-applied, so it never is.
    pub fn is_retriable(&self) -> bool {
        match self {
            SessionError::NotFound { .. } => true,
            SessionError::Engine { op, .. } | SessionError::EngineTimeout { op } => {
                *op != EngineOp::ConnectTransport
            }
            _ => false,
        }
    }

    /// Message safe to send to clients. Engine internals stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            SessionError::NotFound { resource: Resource::Producer, .. } => {
                "Producer is gone".to_string()
            }
            SessionError::Engine { op, .. } => format!("Media server failed during {op}"),
            other => other.to_string(),
        }
    }

    /// Error frame for the client; `request_id` is `None` for unsolicited notices.
    pub fn to_message(&self, request_id: Option<u64>) -> ServerMessage {
        ServerMessage::Error {
            request_id,
            code: self.code(),
            message: self.client_message(),
            retriable: self.is_retriable(),
        }
    }
}
