#![forbid(unsafe_code)]

// Session module - request handling for participants in rooms

pub mod coordinator;
pub(crate) mod engine_call;
pub mod errors;
pub mod sink;

pub use coordinator::{CoordinatorSettings, JoinRequest, SessionCoordinator};
pub use errors::{EngineOp, Resource, SessionError, SessionResult};
pub use sink::{ChannelSink, EventSink, PushError};
