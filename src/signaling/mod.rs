#![forbid(unsafe_code)]

// Signaling module - WebSocket gateway in front of the session coordinator

pub mod connection;
pub mod protocol;

use crate::metrics::ServerMetrics;
use crate::session::SessionCoordinator;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest frame a client may send
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    coordinator: Arc<SessionCoordinator>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    metrics_token: Option<Arc<str>>,
}

impl SignalingServer {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        metrics: ServerMetrics,
        max_connections: usize,
        metrics_token: Option<String>,
    ) -> Self {
        info!("Max connections: {}", max_connections);
        if metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is open");
        }
        Self {
            coordinator,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            metrics_token: metrics_token.map(Arc::from),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr).await?;
        self.serve_on(listener).await
    }

    /// Serves on an already bound listener
    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Signaling server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let registry = server.coordinator.registry();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": registry.room_count(),
        "participants": registry.participant_count(),
    }))
}

/// Metrics handler - Prometheus text exposition format, behind an optional bearer token
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        if provided != expected.as_ref() {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let registry = server.coordinator.registry();
    let body = server
        .metrics
        .render_prometheus(registry.room_count(), registry.participant_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_FRAME_BYTES)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.coordinator, server.metrics, permit)
        })
}
