#![forbid(unsafe_code)]

// Pool of mediasoup workers, one WebRtcServer per worker

use crate::media::config::MediaConfig;
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

pub(super) struct WorkerSlot {
    pub index: usize,
    pub worker: Worker,
    pub webrtc_server: WebRtcServer,
    /// Live consumers on this worker, used for placement
    pub consumers: Arc<AtomicUsize>,
}

pub(super) struct WorkerPool {
    slots: Vec<WorkerSlot>,
    next_worker_idx: AtomicUsize,
    _manager: mediasoup::worker_manager::WorkerManager,
}

impl WorkerPool {
    pub async fn new(config: &MediaConfig) -> MediaResult<Self> {
        let num_workers = config.worker_config.num_workers.max(1);
        info!("Creating mediasoup worker pool with {} workers", num_workers);

        let manager = mediasoup::worker_manager::WorkerManager::new();
        let mut slots = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let worker = manager
                .create_worker(Self::worker_settings(config))
                .await
                .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;
            Self::setup_worker_handlers(&worker, index);

            let webrtc_server = Self::create_webrtc_server(&worker, index, config).await?;
            info!("Worker {} (index {}) ready", worker.id(), index);

            slots.push(WorkerSlot {
                index,
                worker,
                webrtc_server,
                consumers: Arc::new(AtomicUsize::new(0)),
            });
        }

        Ok(Self {
            slots,
            next_worker_idx: AtomicUsize::new(0),
            _manager: manager,
        })
    }

    fn worker_settings(config: &MediaConfig) -> WorkerSettings {
        let workers = &config.worker_config;
        let mut settings = WorkerSettings::default();
        settings.log_level = WorkerLogLevel::Warn;
        settings.log_tags = vec![
            WorkerLogTag::Info,
            WorkerLogTag::Ice,
            WorkerLogTag::Dtls,
            WorkerLogTag::Rtp,
            WorkerLogTag::Rtcp,
        ];
        settings.rtc_port_range = workers.rtc_min_port..=workers.rtc_max_port;
        if let (Some(cert), Some(key)) = (&workers.dtls_certificate_file, &workers.dtls_private_key_file) {
            settings.dtls_files = Some(WorkerDtlsFiles {
                certificate: cert.clone().into(),
                private_key: key.clone().into(),
            });
        }
        settings
    }

    async fn create_webrtc_server(
        worker: &Worker,
        index: usize,
        config: &MediaConfig,
    ) -> MediaResult<WebRtcServer> {
        let port = config
            .worker_config
            .webrtc_server_port_base
            .checked_add(index as u16)
            .ok_or_else(|| MediaError::WorkerError(format!("No WebRtcServer port left for worker {index}")))?;
        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: config.transport_config.listen_ip,
            announced_address: config.transport_config.announced_address.clone(),
            expose_internal_ip: false,
            port: Some(port),
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        };
        let server = worker
            .create_webrtc_server(WebRtcServerOptions::new(WebRtcServerListenInfos::new(listen_info)))
            .await
            .map_err(|e| {
                MediaError::WorkerError(format!(
                    "Failed to create WebRtcServer on port {port} for worker {}: {e}",
                    worker.id()
                ))
            })?;
        debug!("WebRtcServer on UDP {}:{} for worker {}", IpAddr::V4(Ipv4Addr::UNSPECIFIED), port, index);
        Ok(server)
    }

    fn setup_worker_handlers(worker: &Worker, index: usize) {
        let worker_id = worker.id();
        worker
            .on_dead(move |reason| {
                error!("Worker {} (index {}) died: {:?}", worker_id, index, reason);
            })
            .detach();
    }

    /// Worker with the fewest live consumers. Ties rotate so empty pools fill evenly.
    pub fn least_loaded(&self) -> MediaResult<&WorkerSlot> {
        let n = self.slots.len();
        if n == 0 {
            return Err(MediaError::WorkerError("No workers available".to_string()));
        }
        let start = self.next_worker_idx.fetch_add(1, Ordering::Relaxed) % n;
        let slot = (0..n)
            .map(|offset| &self.slots[(start + offset) % n])
            .min_by_key(|slot| slot.consumers.load(Ordering::Relaxed))
            .ok_or_else(|| MediaError::WorkerError("No workers available".to_string()))?;
        debug!(
            "Selected worker {} (index {}, {} consumers)",
            slot.worker.id(),
            slot.index,
            slot.consumers.load(Ordering::Relaxed)
        );
        Ok(slot)
    }

    pub fn loads(&self) -> Vec<usize> {
        self.slots
            .iter()
            .map(|slot| slot.consumers.load(Ordering::Relaxed))
            .collect()
    }

    pub fn close(&mut self) {
        info!("Closing {} mediasoup workers", self.slots.len());
        // WebRtcServers and workers close on drop
        self.slots.clear();
    }
}
