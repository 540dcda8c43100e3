#![forbid(unsafe_code)]

// Delivery of pushed events to a participant's connection

use crate::signaling::protocol::ServerMessage;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("outbound queue is full")]
    Full,
    #[error("peer disconnected")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Where pushed events for one participant go.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Enqueues without waiting. Must not block.
    fn push(&self, message: &ServerMessage) -> Result<(), PushError>;

    /// Waits for queue space instead of failing with [`PushError::Full`].
    async fn send(&self, message: &ServerMessage) -> Result<(), PushError> {
        self.push(message)
    }
}

/// Sink writing pre-serialized JSON into a connection's bounded outbound queue.
/// Replies and pushes share the queue, so they reach the peer in enqueue order.
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Arc<String>>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Arc<String>>) -> Self {
        Self { sender }
    }
}

fn encode(message: &ServerMessage) -> Result<Arc<String>, PushError> {
    serde_json::to_string(message)
        .map(Arc::new)
        .map_err(|e| PushError::Encode(e.to_string()))
}

#[async_trait]
impl EventSink for ChannelSink {
    fn push(&self, message: &ServerMessage) -> Result<(), PushError> {
        self.sender.try_send(encode(message)?).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    async fn send(&self, message: &ServerMessage) -> Result<(), PushError> {
        let json = encode(message)?;
        self.sender.send(json).await.map_err(|_| PushError::Closed)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Sink that records everything pushed to it and can be told to fail.
    #[derive(Default)]
    pub struct RecordingSink {
        messages: Mutex<Vec<ServerMessage>>,
        failing: AtomicBool,
        attempts: Mutex<usize>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            let sink = Self::new();
            sink.failing.store(true, Ordering::SeqCst);
            sink
        }

        pub fn messages(&self) -> Vec<ServerMessage> {
            self.messages.lock().unwrap().clone()
        }

        pub fn named(&self, event: &str) -> Vec<ServerMessage> {
            self.messages()
                .into_iter()
                .filter(|m| m.event_name() == event)
                .collect()
        }

        pub fn attempts(&self) -> usize {
            *self.attempts.lock().unwrap()
        }

        pub fn clear(&self) {
            self.messages.lock().unwrap().clear();
        }
    }

    impl EventSink for RecordingSink {
        fn push(&self, message: &ServerMessage) -> Result<(), PushError> {
            *self.attempts.lock().unwrap() += 1;
            if self.failing.load(Ordering::SeqCst) {
                return Err(PushError::Closed);
            }
            self.messages.lock().unwrap().push(message.clone());
            Ok(())
        }
    }
}
