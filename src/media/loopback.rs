#![forbid(unsafe_code)]

// In-process media engine.
//
// Keeps the full router/transport/producer/consumer lifecycle and codec
// negotiation of a real SFU without moving any packets. Used by the test
// suite and by `MEDIA_ENGINE=loopback` for signaling-only development.

use super::config::MediaConfig;
use super::types::{MediaError, MediaKind, MediaResult, TransportInfo};
use super::{MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Engine calls that can be slowed down or failed on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopbackOp {
    CreateRouter,
    CreateTransport,
    Connect,
    Produce,
    Consume,
    Resume,
}

/// Snapshot of live engine objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub routers_created: usize,
    pub routers_open: usize,
    pub transports_open: usize,
    pub producers_open: usize,
    pub consumers_open: usize,
    pub key_frame_requests: usize,
}

/// Observable state of one open consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerState {
    pub paused: bool,
    pub key_frame_requests: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct ProducerRecord {
    router_id: String,
    mime_type: String,
    consumers: Vec<Weak<LoopbackConsumer>>,
}

struct EngineState {
    config: MediaConfig,
    worker_consumers: Vec<AtomicUsize>,
    next_worker: AtomicUsize,
    delays: Mutex<HashMap<LoopbackOp, Duration>>,
    faults: Mutex<HashMap<LoopbackOp, MediaError>>,
    producers: Mutex<HashMap<String, ProducerRecord>>,
    consumers: Mutex<HashMap<String, Weak<LoopbackConsumer>>>,
    routers_created: AtomicUsize,
    routers_open: AtomicUsize,
    transports_open: AtomicUsize,
    producers_open: AtomicUsize,
    consumers_open: AtomicUsize,
    key_frame_requests: AtomicUsize,
    shut_down: AtomicBool,
}

impl EngineState {
    /// Applies any injected latency, then any injected one-shot failure.
    async fn enter(&self, op: LoopbackOp) -> MediaResult<()> {
        let delay = lock(&self.delays).get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock(&self.faults).remove(&op) {
            return Err(err);
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Err(MediaError::WorkerError("engine is shut down".to_string()));
        }
        Ok(())
    }

    /// Least-loaded worker by consumer count; ties go round-robin.
    fn pick_worker(&self) -> usize {
        let n = self.worker_consumers.len();
        let start = self.next_worker.fetch_add(1, Ordering::Relaxed) % n;
        (0..n)
            .map(|offset| (start + offset) % n)
            .min_by_key(|&idx| self.worker_consumers[idx].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn supported_codec(&self, mime_type: &str) -> Option<MediaKind> {
        self.config
            .codecs
            .iter()
            .find(|c| c.mime_type().eq_ignore_ascii_case(mime_type))
            .map(|c| c.kind())
    }
}

/// Codec MIME types a client advertises in its RTP capabilities.
fn capability_mime_types(rtp_capabilities: &Value) -> Vec<&str> {
    rtp_capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

/// In-process implementation of [`MediaEngine`].
#[derive(Clone)]
pub struct LoopbackEngine {
    state: Arc<EngineState>,
}

impl LoopbackEngine {
    pub fn new(config: MediaConfig) -> Self {
        let workers = config.worker_config.num_workers.max(1);
        info!("Creating loopback media engine with {} workers", workers);
        Self {
            state: Arc::new(EngineState {
                config,
                worker_consumers: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
                next_worker: AtomicUsize::new(0),
                delays: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                routers_created: AtomicUsize::new(0),
                routers_open: AtomicUsize::new(0),
                transports_open: AtomicUsize::new(0),
                producers_open: AtomicUsize::new(0),
                consumers_open: AtomicUsize::new(0),
                key_frame_requests: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Delays every future call of `op` by `delay`.
    pub fn set_delay(&self, op: LoopbackOp, delay: Duration) {
        lock(&self.state.delays).insert(op, delay);
    }

    pub fn clear_delay(&self, op: LoopbackOp) {
        lock(&self.state.delays).remove(&op);
    }

    /// Fails the next call of `op` with `error`.
    pub fn fail_next(&self, op: LoopbackOp, error: MediaError) {
        lock(&self.state.faults).insert(op, error);
    }

    pub fn stats(&self) -> LoopbackStats {
        let s = &self.state;
        LoopbackStats {
            routers_created: s.routers_created.load(Ordering::Acquire),
            routers_open: s.routers_open.load(Ordering::Acquire),
            transports_open: s.transports_open.load(Ordering::Acquire),
            producers_open: s.producers_open.load(Ordering::Acquire),
            consumers_open: s.consumers_open.load(Ordering::Acquire),
            key_frame_requests: s.key_frame_requests.load(Ordering::Acquire),
        }
    }

    pub fn consumer_state(&self, consumer_id: &str) -> Option<ConsumerState> {
        let consumer = lock(&self.state.consumers).get(consumer_id)?.upgrade()?;
        Some(ConsumerState {
            paused: consumer.paused.load(Ordering::Acquire),
            key_frame_requests: consumer.key_frame_requests.load(Ordering::Acquire),
        })
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(&self) -> MediaResult<Arc<dyn MediaRouter>> {
        self.state.enter(LoopbackOp::CreateRouter).await?;
        let worker = self.state.pick_worker();
        let router = Arc::new(LoopbackRouter {
            id: Uuid::new_v4().to_string(),
            worker,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            transports: Mutex::new(Vec::new()),
        });
        self.state.routers_created.fetch_add(1, Ordering::AcqRel);
        self.state.routers_open.fetch_add(1, Ordering::AcqRel);
        debug!("Loopback router {} created on worker {}", router.id, worker);
        Ok(router)
    }

    fn worker_loads(&self) -> Vec<usize> {
        self.state
            .worker_consumers
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    async fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::Release);
        info!("Loopback media engine shut down");
    }
}

struct LoopbackRouter {
    id: String,
    worker: usize,
    state: Arc<EngineState>,
    closed: AtomicBool,
    transports: Mutex<Vec<Arc<LoopbackTransport>>>,
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn worker_index(&self) -> usize {
        self.worker
    }

    fn rtp_capabilities(&self) -> Value {
        self.state.config.rtp_capabilities()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let producers = lock(&self.state.producers);
        let Some(record) = producers.get(producer_id) else {
            return false;
        };
        record.router_id == self.id
            && capability_mime_types(rtp_capabilities)
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&record.mime_type))
    }

    async fn create_webrtc_transport(&self) -> MediaResult<Arc<dyn MediaTransport>> {
        self.state.enter(LoopbackOp::CreateTransport).await?;
        if self.closed() {
            return Err(MediaError::RouterError(format!("router {} is closed", self.id)));
        }
        let transport = Arc::new(LoopbackTransport {
            id: Uuid::new_v4().to_string(),
            router_id: self.id.clone(),
            worker: self.worker,
            state: self.state.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        self.state.transports_open.fetch_add(1, Ordering::AcqRel);
        lock(&self.transports).push(transport.clone());
        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for transport in lock(&self.transports).drain(..) {
            transport.close();
        }
        self.state.routers_open.fetch_sub(1, Ordering::AcqRel);
        debug!("Loopback router {} closed", self.id);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct LoopbackTransport {
    id: String,
    router_id: String,
    worker: usize,
    state: Arc<EngineState>,
    connected: AtomicBool,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed(format!("transport {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        let transport = &self.state.config.transport_config;
        let ip = transport
            .announced_address
            .clone()
            .unwrap_or_else(|| transport.listen_ip.to_string());
        let port = u32::from(self.state.config.worker_config.webrtc_server_port_base)
            + self.worker as u32;
        TransportInfo {
            id: self.id.clone(),
            ice_parameters: json!({
                "usernameFragment": self.id.replace('-', "").chars().take(16).collect::<String>(),
                "password": self.id.replace('-', ""),
                "iceLite": true,
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079u32,
                "address": ip,
                "ip": ip,
                "protocol": "udp",
                "port": port,
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": "00:00:00:00" }],
            }),
        }
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        self.state.enter(LoopbackOp::Connect).await?;
        self.ensure_open()?;
        if dtls_parameters.get("fingerprints").and_then(Value::as_array).is_none() {
            return Err(MediaError::InvalidParameters(
                "dtlsParameters.fingerprints is required".to_string(),
            ));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn MediaProducer>> {
        self.state.enter(LoopbackOp::Produce).await?;
        self.ensure_open()?;
        let mime_type = rtp_parameters
            .get("codecs")
            .and_then(Value::as_array)
            .and_then(|codecs| codecs.first())
            .and_then(|c| c.get("mimeType"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MediaError::InvalidParameters("rtpParameters.codecs[0].mimeType is required".to_string())
            })?;
        match self.state.supported_codec(mime_type) {
            Some(codec_kind) if codec_kind == kind => {}
            Some(_) => {
                return Err(MediaError::Unsupported(format!("{mime_type} is not a {kind} codec")));
            }
            None => {
                return Err(MediaError::Unsupported(format!("codec {mime_type} is not enabled")));
            }
        }

        let producer = Arc::new(LoopbackProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        });
        lock(&self.state.producers).insert(
            producer.id.clone(),
            ProducerRecord {
                router_id: self.router_id.clone(),
                mime_type: mime_type.to_string(),
                consumers: Vec::new(),
            },
        );
        self.state.producers_open.fetch_add(1, Ordering::AcqRel);
        lock(&self.producers).push(producer.clone());
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>> {
        self.state.enter(LoopbackOp::Consume).await?;
        self.ensure_open()?;

        let mut producers = lock(&self.state.producers);
        let record = producers
            .get_mut(producer_id)
            .filter(|r| r.router_id == self.router_id)
            .ok_or_else(|| MediaError::ProducerError(format!("producer {producer_id} not found")))?;
        let codec = self
            .state
            .config
            .codecs
            .iter()
            .find(|c| c.mime_type().eq_ignore_ascii_case(&record.mime_type))
            .ok_or_else(|| MediaError::Unsupported(record.mime_type.clone()))?;
        if !capability_mime_types(&rtp_capabilities)
            .iter()
            .any(|m| m.eq_ignore_ascii_case(codec.mime_type()))
        {
            return Err(MediaError::Unsupported(format!(
                "consumer cannot receive {}",
                codec.mime_type()
            )));
        }

        let ssrc = self.state.routers_created.load(Ordering::Relaxed) as u64 * 1000
            + self.state.consumers_open.load(Ordering::Relaxed) as u64
            + 1;
        let consumer = Arc::new(LoopbackConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind: codec.kind(),
            rtp_parameters: json!({
                "codecs": [codec.to_capability()],
                "encodings": [{ "ssrc": ssrc }],
                "headerExtensions": [],
                "rtcp": { "reducedSize": true },
            }),
            worker: self.worker,
            state: self.state.clone(),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            key_frame_requests: AtomicU64::new(0),
        });
        record.consumers.push(Arc::downgrade(&consumer));
        drop(producers);

        lock(&self.state.consumers).insert(consumer.id.clone(), Arc::downgrade(&consumer));
        self.state.worker_consumers[self.worker].fetch_add(1, Ordering::Relaxed);
        self.state.consumers_open.fetch_add(1, Ordering::AcqRel);
        lock(&self.consumers).push(consumer.clone());
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for producer in lock(&self.producers).drain(..) {
            producer.close();
        }
        for consumer in lock(&self.consumers).drain(..) {
            consumer.close();
        }
        self.state.transports_open.fetch_sub(1, Ordering::AcqRel);
    }
}

struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    state: Arc<EngineState>,
    closed: AtomicBool,
}

impl MediaProducer for LoopbackProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let record = lock(&self.state.producers).remove(&self.id);
        // Consumers of a closed producer close with it
        if let Some(record) = record {
            for consumer in record.consumers.iter().filter_map(Weak::upgrade) {
                consumer.close();
            }
        }
        self.state.producers_open.fetch_sub(1, Ordering::AcqRel);
    }
}

struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    worker: usize,
    state: Arc<EngineState>,
    paused: AtomicBool,
    closed: AtomicBool,
    key_frame_requests: AtomicU64,
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn resume(&self) -> MediaResult<()> {
        self.state.enter(LoopbackOp::Resume).await?;
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn request_key_frame(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed(format!("consumer {}", self.id)));
        }
        self.key_frame_requests.fetch_add(1, Ordering::AcqRel);
        self.state.key_frame_requests.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.state.consumers).remove(&self.id);
        if let Some(record) = lock(&self.state.producers).get_mut(&self.producer_id) {
            record.consumers.retain(|c| c.strong_count() > 0 && !std::ptr::eq(c.as_ptr(), self));
        }
        self.state.worker_consumers[self.worker].fetch_sub(1, Ordering::Relaxed);
        self.state.consumers_open.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::{TransportConfig, WorkerConfig};

    fn engine(workers: usize) -> LoopbackEngine {
        let worker_config = WorkerConfig {
            num_workers: workers,
            ..WorkerConfig::default()
        };
        LoopbackEngine::new(MediaConfig::new(worker_config, TransportConfig::default()))
    }

    fn opus() -> Value {
        json!({ "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }] })
    }

    fn vp8() -> Value {
        json!({ "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000 }] })
    }

    fn dtls() -> Value {
        json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AB" }] })
    }

    #[tokio::test]
    async fn produce_and_consume_with_matching_capabilities() {
        let engine = engine(1);
        let router = engine.create_router().await.unwrap();
        let send = router.create_webrtc_transport().await.unwrap();
        let recv = router.create_webrtc_transport().await.unwrap();
        send.connect(dtls()).await.unwrap();

        let producer = send.produce(MediaKind::Video, vp8()).await.unwrap();
        let caps = router.rtp_capabilities();
        assert!(router.can_consume(&producer.id(), &caps));

        let consumer = recv.consume(&producer.id(), caps, true).await.unwrap();
        assert!(consumer.paused());
        assert_eq!(consumer.kind(), MediaKind::Video);
        assert_eq!(consumer.producer_id(), producer.id());

        consumer.resume().await.unwrap();
        assert!(!consumer.paused());
        assert_eq!(engine.worker_loads(), vec![1]);
    }

    #[tokio::test]
    async fn capability_mismatch_is_reported() {
        let engine = engine(1);
        let router = engine.create_router().await.unwrap();
        let send = router.create_webrtc_transport().await.unwrap();
        let producer = send.produce(MediaKind::Audio, opus()).await.unwrap();

        let video_only = vp8();
        assert!(!router.can_consume(&producer.id(), &video_only));
        let recv = router.create_webrtc_transport().await.unwrap();
        let err = recv.consume(&producer.id(), video_only, true).await.err().unwrap();
        assert!(matches!(err, MediaError::Unsupported(_)));
    }

    #[tokio::test]
    async fn unknown_codec_cannot_be_produced() {
        let engine = engine(1);
        let router = engine.create_router().await.unwrap();
        let send = router.create_webrtc_transport().await.unwrap();
        let params = json!({ "codecs": [{ "mimeType": "video/AV1" }] });
        let err = send.produce(MediaKind::Video, params).await.err().unwrap();
        assert!(matches!(err, MediaError::Unsupported(_)));

        let err = send.produce(MediaKind::Video, json!({})).await.err().unwrap();
        assert!(matches!(err, MediaError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn closing_router_closes_everything_on_it() {
        let engine = engine(2);
        let router = engine.create_router().await.unwrap();
        let send = router.create_webrtc_transport().await.unwrap();
        let recv = router.create_webrtc_transport().await.unwrap();
        let producer = send.produce(MediaKind::Audio, opus()).await.unwrap();
        let consumer = recv
            .consume(&producer.id(), router.rtp_capabilities(), true)
            .await
            .unwrap();
        assert_eq!(engine.stats().consumers_open, 1);

        router.close();
        router.close();
        let stats = engine.stats();
        assert_eq!(stats.routers_open, 0);
        assert_eq!(stats.transports_open, 0);
        assert_eq!(stats.producers_open, 0);
        assert_eq!(stats.consumers_open, 0);
        assert!(consumer.resume().await.is_err());
    }

    #[tokio::test]
    async fn producer_close_closes_its_consumers() {
        let engine = engine(1);
        let router = engine.create_router().await.unwrap();
        let send = router.create_webrtc_transport().await.unwrap();
        let recv = router.create_webrtc_transport().await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8()).await.unwrap();
        let consumer = recv
            .consume(&producer.id(), router.rtp_capabilities(), true)
            .await
            .unwrap();

        producer.close();
        assert!(engine.consumer_state(&consumer.id()).is_none());
        assert!(consumer.resume().await.is_err());
        assert_eq!(engine.stats().consumers_open, 0);
    }

    #[tokio::test]
    async fn closed_consumers_are_forgotten() {
        let engine = engine(1);
        let router = engine.create_router().await.unwrap();
        let send = router.create_webrtc_transport().await.unwrap();
        let recv = router.create_webrtc_transport().await.unwrap();
        let producer = send.produce(MediaKind::Audio, opus()).await.unwrap();

        for _ in 0..50 {
            let consumer = recv
                .consume(&producer.id(), router.rtp_capabilities(), false)
                .await
                .unwrap();
            consumer.close();
        }
        let kept = recv
            .consume(&producer.id(), router.rtp_capabilities(), false)
            .await
            .unwrap();

        assert_eq!(lock(&engine.state.consumers).len(), 1);
        let producers = lock(&engine.state.producers);
        let record = producers.get(&producer.id()).unwrap();
        assert_eq!(record.consumers.len(), 1);
        assert_eq!(record.consumers[0].upgrade().unwrap().id, kept.id());
    }

    #[tokio::test]
    async fn routers_spread_across_workers() {
        let engine = engine(3);
        let mut workers = Vec::new();
        for _ in 0..3 {
            workers.push(engine.create_router().await.unwrap().worker_index());
        }
        workers.sort_unstable();
        assert_eq!(workers, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn injected_fault_fails_once() {
        let engine = engine(1);
        engine.fail_next(LoopbackOp::CreateRouter, MediaError::WorkerError("boom".into()));
        assert!(engine.create_router().await.is_err());
        assert!(engine.create_router().await.is_ok());
    }

    #[tokio::test]
    async fn connect_requires_fingerprints() {
        let engine = engine(1);
        let router = engine.create_router().await.unwrap();
        let transport = router.create_webrtc_transport().await.unwrap();
        let err = transport.connect(json!({ "role": "client" })).await.err().unwrap();
        assert!(matches!(err, MediaError::InvalidParameters(_)));
        transport.connect(dtls()).await.unwrap();
        transport.connect(dtls()).await.unwrap();
    }
}
