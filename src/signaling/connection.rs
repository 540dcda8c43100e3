#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ClientRequest, ErrorCode, ServerMessage};
use crate::metrics::{Counter, ServerMetrics};
use crate::session::{
    ChannelSink, EventSink, JoinRequest, Resource, SessionCoordinator, SessionError, SessionResult,
};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives for this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long queued frames may take to drain once the client is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Token bucket: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;

/// Per-connection token bucket, kept in integer microseconds
struct RateLimiter {
    tokens_us: u64,
    max_tokens_us: u64,
    refill_per_sec: u64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(burst: u64, refill_per_sec: u64, now: Instant) -> Self {
        Self {
            tokens_us: burst * TOKEN_US,
            max_tokens_us: burst * TOKEN_US,
            refill_per_sec,
            last_refill: now,
        }
    }

    /// Takes one token, or returns `false` if the bucket is empty.
    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(self.refill_per_sec))
            .min(self.max_tokens_us);
        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            true
        } else {
            false
        }
    }
}

/// Best-effort correlation ID from a frame that may not parse as a request
fn request_id_of(frame: &Value) -> Option<u64> {
    frame.get("requestId").and_then(Value::as_u64)
}

fn to_data<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!("Failed to encode reply: {}", e);
        Value::Null
    })
}

fn ok() -> Value {
    json!({ "ok": true })
}

fn reply(sink: &Arc<dyn EventSink>, participant_id: &str, message: &ServerMessage) {
    if let Err(e) = sink.push(message) {
        warn!("Could not queue {} for {}: {}", message.event_name(), participant_id, e);
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    coordinator: Arc<SessionCoordinator>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let participant_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", participant_id);

    metrics.inc(Counter::Connections);
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Replies and pushes share this queue, so the client sees them in enqueue order
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    let sink: Arc<dyn EventSink> = Arc::new(ChannelSink::new(tx));

    let send_metrics = metrics.clone();
    let send_pid = participant_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc(Counter::MessagesSent);
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for participant: {}", send_pid);
    });

    let mut limiter = RateLimiter::new(RATE_LIMIT_MAX_TOKENS, RATE_LIMIT_REFILL_RATE, Instant::now());
    let mut rate_limit_warned = false;

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error for {}: {}", participant_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for participant {}", participant_id);
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => {
                info!("Client {} closed connection", participant_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                warn!("Unexpected binary frame from client {}", participant_id);
                continue;
            }
        };
        metrics.inc(Counter::MessagesReceived);

        if !limiter.try_acquire(Instant::now()) {
            metrics.inc(Counter::RateLimited);
            if !rate_limit_warned {
                rate_limit_warned = true;
                warn!("Rate limit exceeded for participant {}", participant_id);
            }
            let request_id = serde_json::from_str::<Value>(text.as_str())
                .ok()
                .as_ref()
                .and_then(request_id_of);
            reply(
                &sink,
                &participant_id,
                &ServerMessage::Error {
                    request_id,
                    code: ErrorCode::RateLimited,
                    message: format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                    retriable: true,
                },
            );
            continue;
        }
        rate_limit_warned = false;

        let frame: Value = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                metrics.inc(Counter::Errors);
                let error = SessionError::validation(format!("Invalid JSON: {e}"));
                reply(&sink, &participant_id, &error.to_message(None));
                continue;
            }
        };
        let request_id = request_id_of(&frame);
        let request: ClientRequest = match serde_json::from_value(frame) {
            Ok(request) => request,
            Err(e) => {
                metrics.inc(Counter::Errors);
                debug!("Invalid request from {}: {}", participant_id, e);
                let error = SessionError::validation(format!("Invalid message format: {e}"));
                reply(&sink, &participant_id, &error.to_message(request_id));
                continue;
            }
        };

        let method = request.message.method();
        let is_join = matches!(request.message, ClientMessage::Join { .. });
        let start = Instant::now();
        let result = dispatch(&coordinator, &participant_id, request.message, &sink).await;
        metrics.observe_request(start.elapsed());

        match result {
            Ok(data) => {
                reply(
                    &sink,
                    &participant_id,
                    &ServerMessage::Response {
                        request_id: request.request_id,
                        data,
                    },
                );
                // Queued pushes must follow the join reply, never precede it
                if is_join {
                    if let Err(e) = coordinator.activate(&participant_id).await {
                        debug!("Participant {} left before activation: {}", participant_id, e);
                    }
                }
            }
            Err(e) => {
                metrics.inc(Counter::Errors);
                match &e {
                    SessionError::Engine { .. } | SessionError::EngineTimeout { .. } => {
                        warn!("{} failed for {}: {}", method, participant_id, e)
                    }
                    _ => debug!("{} rejected for {}: {}", method, participant_id, e),
                }
                reply(&sink, &participant_id, &e.to_message(Some(request.request_id)));
            }
        }

        if send_task.is_finished() {
            break;
        }
    }

    match coordinator.disconnect(&participant_id).await {
        Ok(left) if left.left => info!(
            "Participant {} removed on disconnect (room closed: {})",
            participant_id, left.room_closed
        ),
        Ok(_) => {}
        Err(e) => warn!("Cleanup failed for participant {}: {}", participant_id, e),
    }

    // The room held a clone of the sink; with it gone the send task drains and stops
    drop(sink);
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }

    info!("Connection handler finished for participant: {}", participant_id);
}

/// The explicit room, else the caller's current one
fn resolve_room(
    coordinator: &SessionCoordinator,
    participant_id: &str,
    room_id: Option<String>,
) -> SessionResult<String> {
    room_id
        .or_else(|| coordinator.registry().room_of(participant_id))
        .ok_or_else(|| SessionError::not_found(Resource::Participant, participant_id))
}

/// Routes one request to the coordinator and shapes the reply payload.
async fn dispatch(
    coordinator: &SessionCoordinator,
    participant_id: &str,
    message: ClientMessage,
    sink: &Arc<dyn EventSink>,
) -> SessionResult<Value> {
    match message {
        ClientMessage::Join {
            room_id,
            display_name,
            email,
        } => {
            let request = JoinRequest {
                room_id,
                display_name,
                email,
            };
            let reply = coordinator.join(participant_id, request, sink.clone()).await?;
            Ok(to_data(reply))
        }

        ClientMessage::GetRouterCapabilities => coordinator.router_capabilities(participant_id).await,

        ClientMessage::CreateTransport { producing, consuming } => {
            let room_id = resolve_room(coordinator, participant_id, None)?;
            let info = coordinator
                .create_transport(&room_id, participant_id, producing, consuming)
                .await?;
            Ok(to_data(info))
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            coordinator
                .connect_transport(participant_id, &transport_id, dtls_parameters)
                .await?;
            Ok(ok())
        }

        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } => {
            let reply = coordinator
                .produce(participant_id, &transport_id, kind, rtp_parameters, app_data)
                .await?;
            Ok(to_data(reply))
        }

        ClientMessage::Consume {
            producer_id,
            rtp_capabilities,
            transport_id,
        } => {
            let reply = coordinator
                .consume(participant_id, &producer_id, rtp_capabilities, transport_id.as_deref())
                .await?;
            Ok(to_data(reply))
        }

        ClientMessage::ResumeConsumer { consumer_id } => {
            coordinator.resume_consumer(participant_id, &consumer_id).await?;
            Ok(ok())
        }

        ClientMessage::CloseProducer { producer_id } => {
            coordinator.close_producer(participant_id, &producer_id).await?;
            Ok(ok())
        }

        ClientMessage::ListProducers => {
            let room_id = resolve_room(coordinator, participant_id, None)?;
            let producers = coordinator.list_producers(&room_id, participant_id).await?;
            Ok(to_data(producers))
        }

        ClientMessage::ToggleAudio { enabled } => {
            coordinator.toggle_audio(participant_id, enabled).await?;
            Ok(ok())
        }

        ClientMessage::ToggleVideo { enabled } => {
            coordinator.toggle_video(participant_id, enabled).await?;
            Ok(ok())
        }

        ClientMessage::ToggleScreenShare { enabled } => {
            coordinator.toggle_screen_share(participant_id, enabled).await?;
            Ok(ok())
        }

        ClientMessage::SetStatus { status } => {
            coordinator.set_status(participant_id, status).await?;
            Ok(ok())
        }

        ClientMessage::LeaveRoom { room_id } => {
            let left = match resolve_room(coordinator, participant_id, room_id) {
                Ok(room_id) => coordinator.leave_room(&room_id, participant_id).await?,
                Err(_) => coordinator.disconnect(participant_id).await?,
            };
            Ok(json!({ "ok": true, "left": left.left, "roomClosed": left.room_closed }))
        }

        ClientMessage::SendMessage { room_id, text } => {
            coordinator
                .send_message(room_id.as_deref(), participant_id, &text)
                .await?;
            Ok(ok())
        }
    }
}
