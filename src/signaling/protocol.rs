#![forbid(unsafe_code)]

// Signaling protocol - message types for WebSocket communication

use crate::media::{MediaKind, TransportInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request from a client. Every request carries a correlation ID that the
/// matching `response`/`error` echoes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    pub request_id: u64,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join a room. A missing room ID creates a fresh room.
    #[serde(rename_all = "camelCase")]
    Join {
        #[serde(default)]
        room_id: Option<String>,
        display_name: String,
        #[serde(default)]
        email: Option<String>,
    },
    GetRouterCapabilities,
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        #[serde(default)]
        producing: bool,
        #[serde(default)]
        consuming: bool,
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
        #[serde(default)]
        app_data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        rtp_capabilities: Value,
        #[serde(default)]
        transport_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CloseProducer {
        producer_id: String,
    },
    ListProducers,
    ToggleAudio {
        enabled: bool,
    },
    ToggleVideo {
        enabled: bool,
    },
    ToggleScreenShare {
        enabled: bool,
    },
    SetStatus {
        status: ParticipantStatus,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        #[serde(default)]
        room_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(default)]
        room_id: Option<String>,
        text: String,
    },
}

impl ClientMessage {
    /// Wire name of the request, for logs
    pub fn method(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::GetRouterCapabilities => "getRouterCapabilities",
            ClientMessage::CreateTransport { .. } => "createTransport",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resumeConsumer",
            ClientMessage::CloseProducer { .. } => "closeProducer",
            ClientMessage::ListProducers => "listProducers",
            ClientMessage::ToggleAudio { .. } => "toggleAudio",
            ClientMessage::ToggleVideo { .. } => "toggleVideo",
            ClientMessage::ToggleScreenShare { .. } => "toggleScreenShare",
            ClientMessage::SetStatus { .. } => "setStatus",
            ClientMessage::LeaveRoom { .. } => "leaveRoom",
            ClientMessage::SendMessage { .. } => "sendMessage",
        }
    }
}

/// Server-to-Client messages: request outcomes and pushed events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: u64,
        data: Value,
    },
    /// Failed request, or an unsolicited error when `request_id` is null
    #[serde(rename_all = "camelCase")]
    Error {
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
        retriable: bool,
    },
    ParticipantJoined {
        participant: ParticipantInfo,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        participant_id: String,
    },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        participant_id: String,
        kind: MediaKind,
        is_screen_share: bool,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        participant_id: String,
    },
    #[serde(rename_all = "camelCase")]
    AudioToggled {
        participant_id: String,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    VideoToggled {
        participant_id: String,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareToggled {
        participant_id: String,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        participant_id: String,
        status: ParticipantStatus,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        participant_id: String,
        display_name: String,
        text: String,
        sent_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RoomEnded {
        room_id: String,
        reason: String,
    },
}

impl ServerMessage {
    /// Wire name of the message, for logs
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Response { .. } => "response",
            ServerMessage::Error { .. } => "error",
            ServerMessage::ParticipantJoined { .. } => "participantJoined",
            ServerMessage::ParticipantLeft { .. } => "participantLeft",
            ServerMessage::NewProducer { .. } => "newProducer",
            ServerMessage::ProducerClosed { .. } => "producerClosed",
            ServerMessage::AudioToggled { .. } => "audioToggled",
            ServerMessage::VideoToggled { .. } => "videoToggled",
            ServerMessage::ScreenShareToggled { .. } => "screenShareToggled",
            ServerMessage::StatusChanged { .. } => "statusChanged",
            ServerMessage::ChatMessage { .. } => "chatMessage",
            ServerMessage::RoomEnded { .. } => "roomEnded",
        }
    }
}

/// Stable machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    CapabilityMismatch,
    EngineError,
    EngineTimeout,
    Conflict,
    RoomFull,
    LimitExceeded,
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    #[default]
    Active,
    Away,
    Muted,
}

/// Public view of a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub display_name: String,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub is_screen_sharing: bool,
    pub is_moderator: bool,
    pub joined_at: DateTime<Utc>,
    pub status: ParticipantStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    pub room: RoomSnapshot,
    pub participant: ParticipantInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceReply {
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeReply {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub source_participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: String,
    pub participant_id: String,
    pub kind: MediaKind,
    pub is_screen_share: bool,
}

/// Outcome of `createTransport`
pub type TransportReply = TransportInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveReply {
    pub left: bool,
    pub room_closed: bool,
}
