#![forbid(unsafe_code)]

// Bounded media engine calls

use super::errors::{EngineOp, SessionError, SessionResult};
use crate::media::{MediaResult, Release};
use crate::metrics::{Counter, ServerMetrics};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs an engine call with a deadline.
///
/// The call runs in its own task so that it is never cancelled halfway. If the
/// deadline passes first, the caller gets `EngineTimeout` and whatever the call
/// eventually produces is released instead of leaking.
pub(crate) async fn bounded<T, F>(
    op: EngineOp,
    limit: Duration,
    metrics: &ServerMetrics,
    call: F,
) -> SessionResult<T>
where
    T: Release,
    F: Future<Output = MediaResult<T>> + Send + 'static,
{
    let mut task = tokio::spawn(call);
    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(result)) => result.map_err(|e| SessionError::from_media(op, e)),
        Ok(Err(e)) => Err(SessionError::Engine {
            op,
            reason: format!("engine task failed: {e}"),
        }),
        Err(_) => {
            metrics.inc(Counter::EngineTimeouts);
            warn!("Media engine {} exceeded {:?}", op, limit);
            tokio::spawn(async move {
                if let Ok(Ok(late)) = task.await {
                    debug!("Releasing late result of {}", op);
                    late.release();
                }
            });
            Err(SessionError::EngineTimeout { op })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LoopbackEngine, MediaConfig, MediaEngine, MediaError};
    use crate::media::loopback::LoopbackOp;

    #[tokio::test]
    async fn passes_results_through() {
        let metrics = ServerMetrics::new();
        let value = bounded(EngineOp::Produce, Duration::from_secs(1), &metrics, async { Ok(()) }).await;
        assert!(value.is_ok());

        let err = bounded::<(), _>(EngineOp::Produce, Duration::from_secs(1), &metrics, async {
            Err(MediaError::ProducerError("nope".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::Engine { op: EngineOp::Produce, .. }));
    }

    #[tokio::test]
    async fn late_results_are_released() {
        let metrics = ServerMetrics::new();
        let engine = LoopbackEngine::new(MediaConfig::default());
        engine.set_delay(LoopbackOp::CreateRouter, Duration::from_millis(100));

        let call_engine = engine.clone();
        let err = bounded(EngineOp::CreateRouter, Duration::from_millis(10), &metrics, async move {
            call_engine.create_router().await
        })
        .await
        .err()
        .unwrap();
        assert_eq!(err, SessionError::EngineTimeout { op: EngineOp::CreateRouter });
        assert_eq!(metrics.get(Counter::EngineTimeouts), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let stats = engine.stats();
        assert_eq!(stats.routers_created, 1);
        assert_eq!(stats.routers_open, 0);
    }
}
