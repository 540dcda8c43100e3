#![forbid(unsafe_code)]

use anyhow::Result;
use sfu_signaling::config::{EngineKind, LogFormat, ServerConfig};
use sfu_signaling::media::{LoopbackEngine, MediaConfig, MediaEngine};
use sfu_signaling::metrics::ServerMetrics;
use sfu_signaling::session::SessionCoordinator;
use sfu_signaling::signaling::SignalingServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sfu_signaling=debug,mediasoup=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn create_engine(kind: EngineKind, config: MediaConfig) -> Result<Arc<dyn MediaEngine>> {
    match kind {
        #[cfg(feature = "mediasoup")]
        EngineKind::Mediasoup => {
            let engine = sfu_signaling::media::mediasoup::MediasoupEngine::new(config).await?;
            Ok(Arc::new(engine))
        }
        #[cfg(not(feature = "mediasoup"))]
        EngineKind::Mediasoup => {
            anyhow::bail!("built without the `mediasoup` feature")
        }
        EngineKind::Loopback => Ok(Arc::new(LoopbackEngine::new(config))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env()?;
    init_tracing(config.log_format);

    info!("SFU signaling server starting");
    info!("Configuration: {:?}", config);

    let engine = create_engine(config.engine, config.media.clone()).await?;
    info!(
        "Media engine `{}` ready with {} workers",
        config.engine,
        engine.worker_loads().len()
    );

    let metrics = ServerMetrics::new();
    let coordinator = Arc::new(SessionCoordinator::new(
        engine,
        config.coordinator.clone(),
        metrics.clone(),
    ));

    let signaling_server = SignalingServer::new(
        coordinator.clone(),
        metrics,
        config.max_connections,
        config.metrics_token.clone(),
    );

    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    coordinator.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
