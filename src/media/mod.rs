#![forbid(unsafe_code)]

// Media module - the seam between session logic and the SFU media engine.
// Session code only ever sees these traits; RTP and ICE/DTLS parameters
// pass through as opaque JSON.

pub mod config;
pub mod loopback;
#[cfg(feature = "mediasoup")]
pub mod mediasoup;
pub mod types;

pub use config::{CodecPreference, MediaConfig, TransportConfig, WorkerConfig};
pub use loopback::LoopbackEngine;
pub use types::{MediaError, MediaKind, MediaResult, TransportInfo};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Entry point into a media engine: a pool of workers that host routers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a router on the least-loaded worker.
    async fn create_router(&self) -> MediaResult<Arc<dyn MediaRouter>>;

    /// Live consumer count per worker, in worker order.
    fn worker_loads(&self) -> Vec<usize>;

    /// Closes every worker. Handles created earlier become unusable.
    async fn shutdown(&self);
}

/// One room's media routing context.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> String;

    fn worker_index(&self) -> usize;

    /// Capabilities a client must load before it can produce or consume.
    fn rtp_capabilities(&self) -> Value;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(&self) -> MediaResult<Arc<dyn MediaTransport>>;

    /// Closes the router and everything created on it.
    fn close(&self);

    fn closed(&self) -> bool;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    fn info(&self) -> TransportInfo;

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>>;

    fn close(&self);
}

pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    fn paused(&self) -> bool;

    async fn resume(&self) -> MediaResult<()>;

    async fn request_key_frame(&self) -> MediaResult<()>;

    fn close(&self);
}

/// Releases a handle that nobody will own, e.g. one that arrived after its
/// caller gave up waiting.
pub trait Release: Send + 'static {
    fn release(self);
}

impl Release for () {
    fn release(self) {}
}

impl Release for Arc<dyn MediaRouter> {
    fn release(self) {
        self.close();
    }
}

impl Release for Arc<dyn MediaTransport> {
    fn release(self) {
        self.close();
    }
}

impl Release for Arc<dyn MediaProducer> {
    fn release(self) {
        self.close();
    }
}

impl Release for Arc<dyn MediaConsumer> {
    fn release(self) {
        self.close();
    }
}
