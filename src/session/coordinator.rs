#![forbid(unsafe_code)]

// Session coordinator: validates requests, drives the media engine, keeps the
// registry consistent, and fans events out to the rest of the room.
//
// Engine calls other than router creation never run under a room lock. Each
// operation snapshots the handles it needs, releases the lock, calls the
// engine, then re-locks and re-validates before recording the result.

use super::engine_call::bounded;
use super::errors::{EngineOp, Resource, SessionError, SessionResult};
use super::sink::EventSink;
use crate::media::{MediaConsumer, MediaEngine, MediaKind, MediaResult, Release};
use crate::metrics::{Counter, ServerMetrics};
use crate::room::{
    ConsumerEntry, Fanout, ParticipantSession, ProducerEntry, Room, RoomGuard, RoomRegistry,
    RoomRetention, TransportState,
};
use crate::signaling::protocol::{
    ConsumeReply, JoinReply, LeaveReply, ParticipantStatus, ProduceReply,
    ProducerSummary, ServerMessage, TransportReply,
};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_ROOM_ID_LEN: usize = 128;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_CHAT_LEN: usize = 4096;

/// How long one replayed push may wait for room in the connection's queue
const REPLAY_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Deadline for every media engine call
    pub engine_timeout: Duration,
    pub max_participants_per_room: Option<usize>,
    pub max_consumers_per_participant: usize,
    /// When to repeat the key frame request after a video consumer resumes
    pub key_frame_retries: Vec<Duration>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            engine_timeout: Duration::from_secs(5),
            max_participants_per_room: None,
            max_consumers_per_participant: 32,
            key_frame_retries: vec![Duration::from_millis(500), Duration::from_secs(2)],
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: Option<String>,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Toggle {
    Audio,
    Video,
    ScreenShare,
}

/// Whether a producer's app data marks it as screen content
fn is_screen_share(app_data: &Value) -> bool {
    matches!(
        app_data.get("source").and_then(Value::as_str),
        Some("screen" | "screen-audio")
    ) || app_data
        .get("isScreenShare")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub struct SessionCoordinator {
    registry: Arc<RoomRegistry>,
    settings: CoordinatorSettings,
    metrics: ServerMetrics,
}

impl SessionCoordinator {
    pub fn new(engine: Arc<dyn MediaEngine>, settings: CoordinatorSettings, metrics: ServerMetrics) -> Self {
        let registry = Arc::new(RoomRegistry::new(engine, settings.engine_timeout, metrics.clone()));
        Self {
            registry,
            settings,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    async fn call_engine<T, F>(&self, op: EngineOp, call: F) -> SessionResult<T>
    where
        T: Release,
        F: Future<Output = MediaResult<T>> + Send + 'static,
    {
        bounded(op, self.settings.engine_timeout, &self.metrics, call).await
    }

    fn record_fanout(&self, fanout: Fanout) {
        if fanout.failed > 0 {
            self.metrics.add(Counter::FanoutDropped, fanout.failed as u64);
        }
    }

    /// Locks `room_id` and checks the participant is still in it.
    async fn lock_member(&self, room_id: &str, participant_id: &str) -> SessionResult<RoomGuard> {
        let room = self
            .registry
            .lock_room(room_id)
            .await
            .map_err(|_| SessionError::not_found(Resource::Participant, participant_id))?;
        if !room.contains(participant_id) {
            return Err(SessionError::not_found(Resource::Participant, participant_id));
        }
        Ok(room)
    }

    /// Locks the room the participant is currently in.
    async fn lock_caller(&self, participant_id: &str) -> SessionResult<RoomGuard> {
        let room_id = self
            .registry
            .room_of(participant_id)
            .ok_or_else(|| SessionError::not_found(Resource::Participant, participant_id))?;
        self.lock_member(&room_id, participant_id).await
    }

    /// Adds the caller to a room, creating the room on first join.
    ///
    /// The caller is held in a joining state: pushes addressed to it, including
    /// the producers that already exist, are queued until [`activate`](Self::activate).
    pub async fn join(
        &self,
        participant_id: &str,
        request: JoinRequest,
        sink: Arc<dyn EventSink>,
    ) -> SessionResult<JoinReply> {
        let display_name = request.display_name.trim().to_string();
        if display_name.is_empty() {
            return Err(SessionError::validation("displayName is required"));
        }
        if display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(SessionError::validation(format!(
                "displayName exceeds {MAX_DISPLAY_NAME_LEN} characters"
            )));
        }
        let room_id = match request.room_id.as_deref().map(str::trim) {
            Some("") => return Err(SessionError::validation("roomId must not be empty")),
            Some(id) if id.len() > MAX_ROOM_ID_LEN => {
                return Err(SessionError::validation(format!(
                    "roomId exceeds {MAX_ROOM_ID_LEN} bytes"
                )));
            }
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let email = request
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());

        // A switch holds both rooms, always locked in room id order
        let current = self
            .registry
            .room_of(participant_id)
            .filter(|current| *current != room_id);
        let (mut room, previous) = match current {
            None => (self.registry.get_or_create_room(&room_id).await?, None),
            Some(current) if current < room_id => {
                let previous = self.registry.lock_room(&current).await.ok();
                (self.registry.get_or_create_room(&room_id).await?, previous)
            }
            Some(current) => {
                let room = self.registry.get_or_create_room(&room_id).await?;
                (room, self.registry.lock_room(&current).await.ok())
            }
        };
        let previous = previous.filter(|p| p.contains(participant_id));
        let rejoining = room.contains(participant_id);

        let evicted = room
            .participant_named(&display_name)
            .filter(|p| p.id != participant_id)
            .map(|p| p.id.clone());

        if let Some(limit) = self.settings.max_participants_per_room {
            let occupied = room.len() - usize::from(evicted.is_some()) - usize::from(rejoining);
            if occupied >= limit {
                if room.is_empty() {
                    self.registry.close_room(&mut room);
                }
                return Err(SessionError::RoomFull(format!(
                    "room {room_id} allows {limit} participants"
                )));
            }
        }

        if let Some(mut previous) = previous {
            debug!("Participant {} leaves {} for {}", participant_id, previous.id, room_id);
            self.depart(&mut previous, participant_id, RoomRetention::CloseWhenEmpty);
        }
        if rejoining {
            self.depart(&mut room, participant_id, RoomRetention::KeepOpen);
        }
        if let Some(old_id) = evicted {
            self.evict(&mut room, &old_id);
        }

        let join_seq = room.next_join_seq();
        let moderator = room.is_empty();
        let mut session = ParticipantSession::new(
            participant_id.to_string(),
            display_name,
            email,
            moderator,
            join_seq,
            sink,
        );

        let mut owners: Vec<&ParticipantSession> = room.participants().collect();
        owners.sort_by_key(|p| p.join_seq);
        let existing: Vec<ServerMessage> = owners
            .into_iter()
            .flat_map(|owner| {
                owner.producers().map(move |producer| ServerMessage::NewProducer {
                    producer_id: producer.id.clone(),
                    participant_id: owner.id.clone(),
                    kind: producer.kind,
                    is_screen_share: producer.is_screen_share,
                })
            })
            .collect();
        for event in &existing {
            // Queued until activation
            let _ = session.push(event);
        }

        let participant = session.info();
        let fanout = room.broadcast_except(
            participant_id,
            &ServerMessage::ParticipantJoined {
                participant: participant.clone(),
            },
        );
        self.record_fanout(fanout);

        self.registry.add_participant(&mut room, session);
        self.metrics.inc(Counter::Joins);
        info!(
            "Participant {} ({}) joined room {} ({} participants, {} existing producers)",
            participant.display_name,
            participant_id,
            room.id,
            room.len(),
            existing.len()
        );

        Ok(JoinReply {
            room: room.snapshot(),
            participant,
        })
    }

    /// Marks the join reply as delivered and replays queued pushes in order.
    ///
    /// The replay waits for queue space with the room unlocked, so a join into a
    /// room with many producers is paced by the connection instead of dropped.
    /// Returns how many pushes were delivered.
    pub async fn activate(&self, participant_id: &str) -> SessionResult<usize> {
        let mut delivered = 0;
        loop {
            let (sink, held) = {
                let mut room = self.lock_caller(participant_id).await?;
                let participant = room.participant_mut(participant_id)?;
                if participant.try_activate() {
                    debug!("Participant {} active, replayed {} queued events", participant_id, delivered);
                    return Ok(delivered);
                }
                (participant.sink(), participant.take_held())
            };

            for (sent, message) in held.iter().enumerate() {
                match tokio::time::timeout(REPLAY_SEND_TIMEOUT, sink.send(message)).await {
                    Ok(Ok(())) => delivered += 1,
                    outcome => {
                        let reason = match outcome {
                            Ok(Err(e)) => e.to_string(),
                            _ => "timed out".to_string(),
                        };
                        warn!(
                            "Replay to participant {} stopped at {}: {}",
                            participant_id,
                            message.event_name(),
                            reason
                        );
                        self.abandon_replay(participant_id, held.len() - sent).await;
                        return Ok(delivered);
                    }
                }
            }
        }
    }

    /// Drops whatever is still held and switches the participant to direct delivery.
    async fn abandon_replay(&self, participant_id: &str, unsent: usize) {
        let Ok(mut room) = self.lock_caller(participant_id).await else {
            return;
        };
        if let Ok(participant) = room.participant_mut(participant_id) {
            let dropped = unsent + participant.take_held().len();
            participant.try_activate();
            self.metrics.add(Counter::FanoutDropped, dropped as u64);
        }
    }

    /// Replaces a same-name participant: it is told why, then removed like a leave.
    fn evict(&self, room: &mut Room, participant_id: &str) {
        if let Ok(old) = room.participant(participant_id) {
            let notice = SessionError::Conflict(
                "replaced by a newer session with the same display name".to_string(),
            )
            .to_message(None);
            if let Err(e) = old.sink().push(&notice) {
                debug!("Could not notify evicted participant {}: {}", participant_id, e);
            }
        }
        if self.depart(room, participant_id, RoomRetention::KeepOpen).is_some() {
            self.metrics.inc(Counter::Evictions);
            info!("Evicted participant {} from room {}", participant_id, room.id);
        }
    }

    /// Removes a participant and everything it owns, then tells the others.
    /// Returns `None` if the participant was not in the room.
    fn depart(&self, room: &mut Room, participant_id: &str, retention: RoomRetention) -> Option<LeaveReply> {
        let leaving = room.participant_mut(participant_id).ok()?;
        let closed = leaving.close_all();

        for other in room.participants_mut().filter(|p| p.id != participant_id) {
            for producer_id in &closed.producer_ids {
                other.close_consumers_of(producer_id);
            }
        }

        let departure = self
            .registry
            .remove_participant(room, participant_id, retention)?;
        self.metrics.inc(Counter::Leaves);

        if !departure.room_closed {
            let mut fanout = room.broadcast_except(
                participant_id,
                &ServerMessage::ParticipantLeft {
                    participant_id: participant_id.to_string(),
                },
            );
            for producer_id in &closed.producer_ids {
                let sent = room.broadcast_except(
                    participant_id,
                    &ServerMessage::ProducerClosed {
                        producer_id: producer_id.clone(),
                        participant_id: participant_id.to_string(),
                    },
                );
                fanout.attempted += sent.attempted;
                fanout.failed += sent.failed;
            }
            self.record_fanout(fanout);
        }

        info!(
            "Participant {} left room {} (closed {} transports, {} producers, {} consumers{})",
            participant_id,
            room.id,
            closed.transports,
            closed.producer_ids.len(),
            closed.consumers,
            if departure.room_closed { ", room closed" } else { "" }
        );
        Some(LeaveReply {
            left: true,
            room_closed: departure.room_closed,
        })
    }

    /// Leaves `room_id`. Leaving a room one is not in succeeds with `left: false`.
    pub async fn leave_room(&self, room_id: &str, participant_id: &str) -> SessionResult<LeaveReply> {
        let not_present = LeaveReply {
            left: false,
            room_closed: false,
        };
        let Ok(mut room) = self.registry.lock_room(room_id).await else {
            return Ok(not_present);
        };
        Ok(self
            .depart(&mut room, participant_id, RoomRetention::CloseWhenEmpty)
            .unwrap_or(not_present))
    }

    /// Cleanup for a dropped connection. Safe to call any number of times.
    pub async fn disconnect(&self, participant_id: &str) -> SessionResult<LeaveReply> {
        match self.registry.room_of(participant_id) {
            Some(room_id) => self.leave_room(&room_id, participant_id).await,
            None => Ok(LeaveReply {
                left: false,
                room_closed: false,
            }),
        }
    }

    pub async fn router_capabilities(&self, participant_id: &str) -> SessionResult<Value> {
        let room = self.lock_caller(participant_id).await?;
        Ok(room.router()?.rtp_capabilities())
    }

    pub async fn create_transport(
        &self,
        room_id: &str,
        participant_id: &str,
        producing: bool,
        consuming: bool,
    ) -> SessionResult<TransportReply> {
        if !producing && !consuming {
            return Err(SessionError::validation(
                "a transport must be created for producing, consuming, or both",
            ));
        }
        let router = self.lock_member(room_id, participant_id).await?.router()?;

        let transport = self
            .call_engine(EngineOp::CreateTransport, async move {
                router.create_webrtc_transport().await
            })
            .await?;

        let mut room = match self.lock_member(room_id, participant_id).await {
            Ok(room) => room,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        let info = transport.info();
        room.participant_mut(participant_id)?
            .insert_transport(transport, producing, consuming);
        debug!(
            "Created transport {} for {} (producing: {}, consuming: {})",
            info.id, participant_id, producing, consuming
        );
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        participant_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> SessionResult<()> {
        let (room_id, handle) = {
            let mut room = self.lock_caller(participant_id).await?;
            let room_id = room.id.clone();
            let entry = room
                .participant_mut(participant_id)?
                .transport_mut(transport_id)?;
            match entry.state {
                TransportState::Connected => return Ok(()),
                TransportState::Connecting => {
                    return Err(SessionError::validation(format!(
                        "transport {transport_id} is already connecting"
                    )));
                }
                TransportState::Pending => entry.state = TransportState::Connecting,
            }
            (room_id, entry.handle.clone())
        };

        let result = self
            .call_engine(EngineOp::ConnectTransport, async move {
                handle.connect(dtls_parameters).await
            })
            .await;

        let mut room = self.lock_member(&room_id, participant_id).await?;
        let entry = room
            .participant_mut(participant_id)?
            .transport_mut(transport_id)?;
        match result {
            Ok(()) => {
                entry.state = TransportState::Connected;
                debug!("Transport {} connected for {}", transport_id, participant_id);
                Ok(())
            }
            Err(e) => {
                entry.state = TransportState::Pending;
                Err(e)
            }
        }
    }

    pub async fn produce(
        &self,
        participant_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> SessionResult<ProduceReply> {
        let is_screen_share = is_screen_share(&app_data);
        let (room_id, handle) = {
            let room = self.lock_caller(participant_id).await?;
            let transport = room.participant(participant_id)?.transport(transport_id)?;
            if !transport.producing {
                return Err(SessionError::validation(format!(
                    "transport {transport_id} was not created for producing"
                )));
            }
            if transport.state != TransportState::Connected {
                return Err(SessionError::validation(format!(
                    "transport {transport_id} is not connected"
                )));
            }
            (room.id.clone(), transport.handle.clone())
        };

        let producer = self
            .call_engine(EngineOp::Produce, async move {
                handle.produce(kind, rtp_parameters).await
            })
            .await?;
        let producer_id = producer.id();

        let mut room = match self.lock_member(&room_id, participant_id).await {
            Ok(room) => room,
            Err(e) => {
                producer.close();
                return Err(e);
            }
        };
        let entry = ProducerEntry {
            id: producer_id.clone(),
            handle: producer.clone(),
            transport_id: transport_id.to_string(),
            kind,
            is_screen_share,
        };
        if let Err(e) = room
            .participant_mut(participant_id)
            .and_then(|p| p.insert_producer(entry))
        {
            // Transport went away while the engine was busy
            producer.close();
            return Err(e);
        }

        let fanout = room.broadcast_except(
            participant_id,
            &ServerMessage::NewProducer {
                producer_id: producer_id.clone(),
                participant_id: participant_id.to_string(),
                kind,
                is_screen_share,
            },
        );
        self.record_fanout(fanout);
        self.metrics.inc(Counter::ProducersCreated);
        info!(
            "Participant {} producing {} ({}) in room {}, announced to {}",
            participant_id, kind, producer_id, room.id, fanout.attempted
        );
        Ok(ProduceReply { producer_id })
    }

    /// Creates a paused consumer of another participant's producer.
    pub async fn consume(
        &self,
        participant_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
        transport_id: Option<&str>,
    ) -> SessionResult<ConsumeReply> {
        let (room_id, transport_id, handle, source_participant_id) = {
            let room = self.lock_caller(participant_id).await?;
            let me = room.participant(participant_id)?;
            if me.consumer_count() >= self.settings.max_consumers_per_participant {
                return Err(SessionError::LimitExceeded(format!(
                    "at most {} consumers per participant",
                    self.settings.max_consumers_per_participant
                )));
            }
            let (owner, _) = room
                .find_producer(producer_id)
                .ok_or_else(|| SessionError::not_found(Resource::Producer, producer_id))?;
            if owner.id == participant_id {
                return Err(SessionError::validation("cannot consume your own producer"));
            }
            let transport = match transport_id {
                Some(id) => {
                    let transport = me.transport(id)?;
                    if !transport.consuming {
                        return Err(SessionError::validation(format!(
                            "transport {id} was not created for consuming"
                        )));
                    }
                    transport
                }
                None => me.default_consuming_transport().ok_or_else(|| {
                    SessionError::validation("no consuming transport; create one first")
                })?,
            };
            if !room.router()?.can_consume(producer_id, &rtp_capabilities) {
                return Err(SessionError::CapabilityMismatch(format!(
                    "cannot receive producer {producer_id} with the given RTP capabilities"
                )));
            }
            (
                room.id.clone(),
                transport.id.clone(),
                transport.handle.clone(),
                owner.id.clone(),
            )
        };

        let target = producer_id.to_string();
        let consumer: Arc<dyn MediaConsumer> = match self
            .call_engine(EngineOp::Consume, async move {
                handle.consume(&target, rtp_capabilities, true).await
            })
            .await
        {
            Ok(consumer) => consumer,
            Err(e @ SessionError::Engine { .. }) => {
                // The producer may have closed while the engine was working
                let room = self.lock_member(&room_id, participant_id).await?;
                if room.find_producer(producer_id).is_none() {
                    return Err(SessionError::not_found(Resource::Producer, producer_id));
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut room = match self.lock_member(&room_id, participant_id).await {
            Ok(room) => room,
            Err(e) => {
                consumer.close();
                return Err(e);
            }
        };
        let entry = ConsumerEntry {
            id: consumer.id(),
            handle: consumer.clone(),
            transport_id,
            producer_id: producer_id.to_string(),
            source_participant_id: source_participant_id.clone(),
            kind: consumer.kind(),
            resumed: false,
        };
        let recorded = if room.find_producer(producer_id).is_none() {
            Err(SessionError::not_found(Resource::Producer, producer_id))
        } else {
            room.participant_mut(participant_id)
                .and_then(|p| p.insert_consumer(entry))
        };
        if let Err(e) = recorded {
            consumer.close();
            return Err(e);
        }

        self.metrics.inc(Counter::ConsumersCreated);
        debug!(
            "Participant {} consuming {} from {} (consumer {})",
            participant_id,
            producer_id,
            source_participant_id,
            consumer.id()
        );
        Ok(ConsumeReply {
            consumer_id: consumer.id(),
            producer_id: producer_id.to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            source_participant_id,
        })
    }

    /// Starts media flow on a consumer. Resuming twice is a no-op.
    pub async fn resume_consumer(&self, participant_id: &str, consumer_id: &str) -> SessionResult<()> {
        let (room_id, handle) = {
            let room = self.lock_caller(participant_id).await?;
            let consumer = room.participant(participant_id)?.consumer(consumer_id)?;
            if consumer.resumed {
                return Ok(());
            }
            (room.id.clone(), consumer.handle.clone())
        };

        let call = handle.clone();
        self.call_engine(EngineOp::ResumeConsumer, async move { call.resume().await })
            .await?;

        {
            let mut room = self.lock_member(&room_id, participant_id).await?;
            room.participant_mut(participant_id)?
                .consumer_mut(consumer_id)?
                .resumed = true;
        }

        if handle.kind() == MediaKind::Video {
            self.request_key_frames(handle).await;
        }
        Ok(())
    }

    /// One key frame request now, then a few more on a schedule so a freshly
    /// resumed video stream does not wait for the sender's next natural key frame.
    async fn request_key_frames(&self, consumer: Arc<dyn MediaConsumer>) {
        match tokio::time::timeout(self.settings.engine_timeout, consumer.request_key_frame()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Key frame request failed for consumer {}: {}", consumer.id(), e),
            Err(_) => debug!("Key frame request timed out for consumer {}", consumer.id()),
        }

        let schedule = self.settings.key_frame_retries.clone();
        if schedule.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let mut elapsed = Duration::ZERO;
            for at in schedule {
                tokio::time::sleep(at.saturating_sub(elapsed)).await;
                elapsed = at;
                if let Err(e) = consumer.request_key_frame().await {
                    debug!("Stopped key frame retries for consumer {}: {}", consumer.id(), e);
                    break;
                }
            }
        });
    }

    /// Stops one of the caller's producers and every consumer fed by it.
    pub async fn close_producer(&self, participant_id: &str, producer_id: &str) -> SessionResult<()> {
        let mut room = self.lock_caller(participant_id).await?;
        let entry = room
            .participant_mut(participant_id)?
            .remove_producer(producer_id)
            .ok_or_else(|| SessionError::not_found(Resource::Producer, producer_id))?;
        for other in room.participants_mut() {
            other.close_consumers_of(producer_id);
        }
        entry.handle.close();

        let fanout = room.broadcast_except(
            participant_id,
            &ServerMessage::ProducerClosed {
                producer_id: producer_id.to_string(),
                participant_id: participant_id.to_string(),
            },
        );
        self.record_fanout(fanout);
        info!("Participant {} closed producer {}", participant_id, producer_id);
        Ok(())
    }

    /// Other participants' producers in the room
    pub async fn list_producers(&self, room_id: &str, participant_id: &str) -> SessionResult<Vec<ProducerSummary>> {
        let handle = self.registry.get_room(room_id)?;
        let room = handle.read().await;
        if room.is_closed() || !room.contains(participant_id) {
            return Err(SessionError::not_found(Resource::Participant, participant_id));
        }
        let mut owners: Vec<&ParticipantSession> = room
            .participants()
            .filter(|p| p.id != participant_id)
            .collect();
        owners.sort_by_key(|p| p.join_seq);
        Ok(owners
            .into_iter()
            .flat_map(|owner| {
                owner.producers().map(move |producer| ProducerSummary {
                    producer_id: producer.id.clone(),
                    participant_id: owner.id.clone(),
                    kind: producer.kind,
                    is_screen_share: producer.is_screen_share,
                })
            })
            .collect())
    }

    async fn toggle(&self, participant_id: &str, toggle: Toggle, enabled: bool) -> SessionResult<()> {
        let mut room = self.lock_caller(participant_id).await?;
        let participant = room.participant_mut(participant_id)?;
        let id = participant_id.to_string();
        let event = match toggle {
            Toggle::Audio => {
                participant.audio_enabled = enabled;
                ServerMessage::AudioToggled { participant_id: id, enabled }
            }
            Toggle::Video => {
                participant.video_enabled = enabled;
                ServerMessage::VideoToggled { participant_id: id, enabled }
            }
            Toggle::ScreenShare => {
                participant.screen_sharing = enabled;
                ServerMessage::ScreenShareToggled { participant_id: id, enabled }
            }
        };
        let fanout = room.broadcast_except(participant_id, &event);
        self.record_fanout(fanout);
        Ok(())
    }

    pub async fn toggle_audio(&self, participant_id: &str, enabled: bool) -> SessionResult<()> {
        self.toggle(participant_id, Toggle::Audio, enabled).await
    }

    pub async fn toggle_video(&self, participant_id: &str, enabled: bool) -> SessionResult<()> {
        self.toggle(participant_id, Toggle::Video, enabled).await
    }

    pub async fn toggle_screen_share(&self, participant_id: &str, enabled: bool) -> SessionResult<()> {
        self.toggle(participant_id, Toggle::ScreenShare, enabled).await
    }

    pub async fn set_status(&self, participant_id: &str, status: ParticipantStatus) -> SessionResult<()> {
        let mut room = self.lock_caller(participant_id).await?;
        room.participant_mut(participant_id)?.status = status;
        let fanout = room.broadcast_except(
            participant_id,
            &ServerMessage::StatusChanged {
                participant_id: participant_id.to_string(),
                status,
            },
        );
        self.record_fanout(fanout);
        Ok(())
    }

    /// Relays a chat line to everyone else in the room. Nothing is stored.
    pub async fn send_message(&self, room_id: Option<&str>, participant_id: &str, text: &str) -> SessionResult<Fanout> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::validation("message text is required"));
        }
        if text.chars().count() > MAX_CHAT_LEN {
            return Err(SessionError::validation(format!(
                "message exceeds {MAX_CHAT_LEN} characters"
            )));
        }
        let mut room = match room_id {
            Some(room_id) => self.lock_member(room_id, participant_id).await?,
            None => self.lock_caller(participant_id).await?,
        };
        let display_name = room.participant(participant_id)?.display_name.clone();
        let fanout = room.broadcast_except(
            participant_id,
            &ServerMessage::ChatMessage {
                participant_id: participant_id.to_string(),
                display_name,
                text: text.to_string(),
                sent_at: Utc::now(),
            },
        );
        self.record_fanout(fanout);
        Ok(fanout)
    }

    /// Ends every room, releases all media resources and stops the engine.
    pub async fn shutdown(&self) {
        let room_ids = self.registry.room_ids();
        info!("Shutting down {} rooms", room_ids.len());
        for room_id in room_ids {
            let Ok(mut room) = self.registry.lock_room(&room_id).await else {
                continue;
            };
            let ended = ServerMessage::RoomEnded {
                room_id: room_id.clone(),
                reason: "server shutting down".to_string(),
            };
            for participant in room.participants_mut() {
                if let Err(e) = participant.sink().push(&ended) {
                    debug!("Could not notify {} of shutdown: {}", participant.id, e);
                }
                participant.close_all();
            }
            self.registry.close_room(&mut room);
        }
        self.registry.engine().shutdown().await;
        if self.registry.participant_count() > 0 {
            warn!("{} participants still indexed after shutdown", self.registry.participant_count());
        }
    }
}
