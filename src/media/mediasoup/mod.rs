#![forbid(unsafe_code)]

// mediasoup-backed media engine

mod worker_pool;

use super::config::{CodecPreference, MediaConfig};
use super::types::{MediaError, MediaKind, MediaResult, TransportInfo};
use super::{MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport};
use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::rtp_parameters::MediaKind as NativeKind;
use serde_json::Value;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock as StdRwLock};
use tracing::{debug, info, warn};
use worker_pool::WorkerPool;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn to_native_kind(kind: MediaKind) -> NativeKind {
    match kind {
        MediaKind::Audio => NativeKind::Audio,
        MediaKind::Video => NativeKind::Video,
    }
}

fn from_native_kind(kind: NativeKind) -> MediaKind {
    match kind {
        NativeKind::Audio => MediaKind::Audio,
        NativeKind::Video => MediaKind::Video,
    }
}

fn video_feedback() -> Vec<RtcpFeedback> {
    vec![
        RtcpFeedback::Nack,
        RtcpFeedback::NackPli,
        RtcpFeedback::CcmFir,
        RtcpFeedback::GoogRemb,
        RtcpFeedback::TransportCc,
    ]
}

fn native_codec(codec: &CodecPreference) -> RtpCodecCapability {
    let clock_rate = NonZeroU32::new(codec.clock_rate()).unwrap_or(NonZeroU32::MIN);
    match codec {
        CodecPreference::Opus => RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(codec.preferred_payload_type()),
            clock_rate,
            channels: NonZeroU8::new(2).unwrap_or(NonZeroU8::MIN),
            parameters: RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
            ]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        CodecPreference::Vp8 | CodecPreference::Vp9 => RtpCodecCapability::Video {
            mime_type: if *codec == CodecPreference::Vp8 {
                MimeTypeVideo::Vp8
            } else {
                MimeTypeVideo::Vp9
            },
            preferred_payload_type: Some(codec.preferred_payload_type()),
            clock_rate,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        CodecPreference::H264 { profile_level_id } => RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(codec.preferred_payload_type()),
            clock_rate,
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", (*profile_level_id).into()),
            ]),
            rtcp_feedback: video_feedback(),
        },
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> MediaResult<T> {
    serde_json::from_value(value).map_err(|e| MediaError::InvalidParameters(format!("{what}: {e}")))
}

/// [`MediaEngine`] backed by native mediasoup workers.
pub struct MediasoupEngine {
    pool: StdRwLock<WorkerPool>,
    codecs: Vec<RtpCodecCapability>,
    config: MediaConfig,
}

impl MediasoupEngine {
    pub async fn new(config: MediaConfig) -> MediaResult<Self> {
        let pool = WorkerPool::new(&config).await?;
        let codecs = config.codecs.iter().map(native_codec).collect();
        Ok(Self {
            pool: StdRwLock::new(pool),
            codecs,
            config,
        })
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(&self) -> MediaResult<Arc<dyn MediaRouter>> {
        let (index, worker, webrtc_server, consumers) = {
            let pool = self.pool.read().unwrap_or_else(|e| e.into_inner());
            let slot = pool.least_loaded()?;
            (slot.index, slot.worker.clone(), slot.webrtc_server.clone(), slot.consumers.clone())
        };

        let router = worker
            .create_router(RouterOptions::new(self.codecs.clone()))
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;
        let id = router.id().to_string();

        router
            .on_close({
                let id = id.clone();
                move || debug!("Router {} closed", id)
            })
            .detach();
        router
            .on_worker_close({
                let id = id.clone();
                move || warn!("Worker closed under router {}", id)
            })
            .detach();

        info!("Created router {} on worker {}", id, index);
        Ok(Arc::new(MediasoupRouter {
            id,
            worker: index,
            router: Mutex::new(Some(router)),
            webrtc_server,
            consumers,
            transport_config: self.config.transport_config.clone(),
        }))
    }

    fn worker_loads(&self) -> Vec<usize> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).loads()
    }

    async fn shutdown(&self) {
        self.pool.write().unwrap_or_else(|e| e.into_inner()).close();
    }
}

struct MediasoupRouter {
    id: String,
    worker: usize,
    router: Mutex<Option<Router>>,
    webrtc_server: WebRtcServer,
    consumers: Arc<AtomicUsize>,
    transport_config: crate::media::config::TransportConfig,
}

impl MediasoupRouter {
    fn router(&self) -> MediaResult<Router> {
        lock(&self.router)
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("router {}", self.id)))
    }
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn worker_index(&self) -> usize {
        self.worker
    }

    fn rtp_capabilities(&self) -> Value {
        self.router()
            .ok()
            .and_then(|router| serde_json::to_value(router.rtp_capabilities()).ok())
            .unwrap_or(Value::Null)
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(router) = self.router() else {
            return false;
        };
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        let Ok(caps) = serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) else {
            return false;
        };
        router.can_consume(&producer_id, &caps)
    }

    async fn create_webrtc_transport(&self) -> MediaResult<Arc<dyn MediaTransport>> {
        let router = self.router()?;
        let mut options = WebRtcTransportOptions::new_with_server(self.webrtc_server.clone());
        options.initial_available_outgoing_bitrate =
            self.transport_config.initial_available_outgoing_bitrate;
        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create transport: {e}")))?;

        if let Some(max) = self.transport_config.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(max).await {
                warn!("Failed to cap incoming bitrate on transport {}: {}", transport.id(), e);
            }
        }

        let id = transport.id().to_string();
        transport
            .on_dtls_state_change({
                let id = id.clone();
                move |state| debug!("DTLS state {:?} on transport {}", state, id)
            })
            .detach();
        transport
            .on_ice_state_change({
                let id = id.clone();
                move |state| debug!("ICE state {:?} on transport {}", state, id)
            })
            .detach();

        let info = TransportInfo {
            id: id.clone(),
            ice_parameters: serde_json::to_value(transport.ice_parameters()).unwrap_or(Value::Null),
            ice_candidates: serde_json::to_value(transport.ice_candidates()).unwrap_or(Value::Null),
            dtls_parameters: serde_json::to_value(transport.dtls_parameters()).unwrap_or(Value::Null),
        };
        Ok(Arc::new(MediasoupTransport {
            id,
            info,
            transport: Mutex::new(Some(transport)),
            consumers: self.consumers.clone(),
        }))
    }

    fn close(&self) {
        // Dropping the last handle closes the native router
        if lock(&self.router).take().is_some() {
            debug!("Releasing router {}", self.id);
        }
    }

    fn closed(&self) -> bool {
        lock(&self.router).as_ref().map_or(true, |r| r.closed())
    }
}

struct MediasoupTransport {
    id: String,
    info: TransportInfo,
    transport: Mutex<Option<WebRtcTransport>>,
    consumers: Arc<AtomicUsize>,
}

impl MediasoupTransport {
    fn transport(&self) -> MediaResult<WebRtcTransport> {
        lock(&self.transport)
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("transport {}", self.id)))
    }
}

#[async_trait]
impl MediaTransport for MediasoupTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        self.info.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters = parse(dtls_parameters, "dtlsParameters")?;
        self.transport()?
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn MediaProducer>> {
        let rtp_parameters: RtpParameters = parse(rtp_parameters, "rtpParameters")?;
        let producer = self
            .transport()?
            .produce(ProducerOptions::new(to_native_kind(kind), rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;
        Ok(Arc::new(MediasoupProducer {
            id: producer.id().to_string(),
            kind,
            producer: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>> {
        let producer_id = producer_id
            .parse::<ProducerId>()
            .map_err(|e| MediaError::InvalidParameters(format!("producerId: {e}")))?;
        let rtp_capabilities: RtpCapabilities = parse(rtp_capabilities, "rtpCapabilities")?;
        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = paused;
        let consumer = self
            .transport()?
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        self.consumers.fetch_add(1, Ordering::Relaxed);
        consumer
            .on_close({
                let counter = self.consumers.clone();
                move || {
                    counter.fetch_sub(1, Ordering::Relaxed);
                }
            })
            .detach();

        let rtp_parameters = serde_json::to_value(consumer.rtp_parameters()).unwrap_or(Value::Null);
        Ok(Arc::new(MediasoupConsumer {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: from_native_kind(consumer.kind()),
            rtp_parameters,
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    fn close(&self) {
        lock(&self.transport).take();
    }
}

struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    producer: Mutex<Option<Producer>>,
}

impl MediaProducer for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        lock(&self.producer).take();
    }
}

struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer: Mutex<Option<Consumer>>,
}

impl MediasoupConsumer {
    fn consumer(&self) -> MediaResult<Consumer> {
        lock(&self.consumer)
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("consumer {}", self.id)))
    }
}

#[async_trait]
impl MediaConsumer for MediasoupConsumer {
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
        lock(&self.consumer).as_ref().map_or(true, |c| c.paused())
    }

    async fn resume(&self) -> MediaResult<()> {
        self.consumer()?
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))
    }

    async fn request_key_frame(&self) -> MediaResult<()> {
        self.consumer()?
            .request_key_frame()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to request key frame: {e}")))
    }

    fn close(&self) {
        lock(&self.consumer).take();
    }
}
