#![forbid(unsafe_code)]

// SFU signaling library - room, session and media coordination behind a WebSocket gateway

pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod session;
pub mod signaling;
