#![forbid(unsafe_code)]

// Room registry: one entry per live room, each room owning exactly one router
// for as long as it has participants.

pub mod participant;

pub use participant::{
    ClosedResources, ConsumerEntry, ParticipantSession, ProducerEntry, TransportEntry,
    TransportState,
};

use crate::media::{MediaEngine, MediaRouter};
use crate::metrics::{Counter, ServerMetrics};
use crate::session::engine_call::bounded;
use crate::session::errors::{EngineOp, Resource, SessionError, SessionResult};
use crate::session::sink::PushError;
use crate::signaling::protocol::{RoomSnapshot, ServerMessage};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock as TokioRwLock};
use tracing::{debug, info, warn};

pub type RoomHandle = Arc<TokioRwLock<Room>>;
pub type RoomGuard = OwnedRwLockWriteGuard<Room>;

/// Outcome of pushing one event to a set of participants
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fanout {
    pub attempted: usize,
    pub failed: usize,
}

pub struct Room {
    pub id: String,
    pub created_at: DateTime<Utc>,
    generation: u64,
    router: Option<Arc<dyn MediaRouter>>,
    participants: HashMap<String, ParticipantSession>,
    closed: bool,
    next_join_seq: u64,
}

impl Room {
    fn new(id: String, generation: u64) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            generation,
            router: None,
            participants: HashMap::new(),
            closed: false,
            next_join_seq: 0,
        }
    }

    pub fn router(&self) -> SessionResult<Arc<dyn MediaRouter>> {
        self.router
            .clone()
            .ok_or_else(|| SessionError::not_found(Resource::Room, &self.id))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.contains_key(participant_id)
    }

    pub fn participant(&self, participant_id: &str) -> SessionResult<&ParticipantSession> {
        self.participants
            .get(participant_id)
            .ok_or_else(|| SessionError::not_found(Resource::Participant, participant_id))
    }

    pub fn participant_mut(&mut self, participant_id: &str) -> SessionResult<&mut ParticipantSession> {
        self.participants
            .get_mut(participant_id)
            .ok_or_else(|| SessionError::not_found(Resource::Participant, participant_id))
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantSession> {
        self.participants.values()
    }

    pub fn participants_mut(&mut self) -> impl Iterator<Item = &mut ParticipantSession> {
        self.participants.values_mut()
    }

    pub fn participant_named(&self, display_name: &str) -> Option<&ParticipantSession> {
        self.participants
            .values()
            .find(|p| p.display_name == display_name)
    }

    pub fn next_join_seq(&mut self) -> u64 {
        let seq = self.next_join_seq;
        self.next_join_seq += 1;
        seq
    }

    /// Owner and entry of a producer anywhere in the room
    pub fn find_producer(&self, producer_id: &str) -> Option<(&ParticipantSession, &ProducerEntry)> {
        self.participants
            .values()
            .find_map(|p| p.producer(producer_id).map(|entry| (p, entry)))
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let mut participants: Vec<&ParticipantSession> = self.participants.values().collect();
        participants.sort_by_key(|p| p.join_seq);
        RoomSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            participants: participants.into_iter().map(ParticipantSession::info).collect(),
        }
    }

    /// Pushes `message` to everyone but `except`. Delivery failures are logged, not returned.
    pub fn broadcast_except(&mut self, except: &str, message: &ServerMessage) -> Fanout {
        let mut fanout = Fanout::default();
        for participant in self.participants.values_mut().filter(|p| p.id != except) {
            fanout.attempted += 1;
            if let Err(e) = participant.push(message) {
                fanout.failed += 1;
                log_push_failure(&participant.id, message, &e);
            }
        }
        fanout
    }

    pub fn broadcast_all(&mut self, message: &ServerMessage) -> Fanout {
        self.broadcast_except("", message)
    }

    pub fn send_to(&mut self, participant_id: &str, message: &ServerMessage) -> Result<(), PushError> {
        let Some(participant) = self.participants.get_mut(participant_id) else {
            return Err(PushError::Closed);
        };
        let result = participant.push(message);
        if let Err(e) = &result {
            log_push_failure(participant_id, message, e);
        }
        result
    }
}

fn log_push_failure(participant_id: &str, message: &ServerMessage, error: &PushError) {
    match error {
        PushError::Full => warn!(
            "Outbound queue full for {}, dropped {}",
            participant_id,
            message.event_name()
        ),
        PushError::Closed => debug!(
            "Participant {} disconnected, dropped {}",
            participant_id,
            message.event_name()
        ),
        PushError::Encode(e) => warn!("Failed to encode {}: {}", message.event_name(), e),
    }
}

/// Whether removing the last participant closes the room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomRetention {
    CloseWhenEmpty,
    KeepOpen,
}

pub struct Departure {
    pub session: ParticipantSession,
    pub room_closed: bool,
}

struct RoomSlot {
    generation: u64,
    handle: RoomHandle,
}

/// Registry of live rooms.
///
/// Lookups take the outer map lock briefly; everything else happens under the
/// room's own lock, so unrelated rooms never contend.
pub struct RoomRegistry {
    engine: Arc<dyn MediaEngine>,
    rooms: StdRwLock<HashMap<String, RoomSlot>>,
    participant_rooms: StdRwLock<HashMap<String, String>>,
    next_generation: AtomicU64,
    engine_timeout: Duration,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, engine_timeout: Duration, metrics: ServerMetrics) -> Self {
        Self {
            engine,
            rooms: StdRwLock::new(HashMap::new()),
            participant_rooms: StdRwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            engine_timeout,
            metrics,
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    pub fn get_room(&self, room_id: &str) -> SessionResult<RoomHandle> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .map(|slot| slot.handle.clone())
            .ok_or_else(|| SessionError::not_found(Resource::Room, room_id))
    }

    /// Locks a live room for writing.
    pub async fn lock_room(&self, room_id: &str) -> SessionResult<RoomGuard> {
        let guard = self.get_room(room_id)?.write_owned().await;
        if guard.closed {
            return Err(SessionError::not_found(Resource::Room, room_id));
        }
        Ok(guard)
    }

    /// Room the participant currently belongs to
    pub fn room_of(&self, participant_id: &str) -> Option<String> {
        let index = self.participant_rooms.read().unwrap_or_else(|e| e.into_inner());
        index.get(participant_id).cloned()
    }

    /// Returns the room locked for writing, creating it and its router if needed.
    ///
    /// The router is created under the room lock, so concurrent joiners of a new
    /// room wait for the first one and all end up on the same router.
    pub async fn get_or_create_room(&self, room_id: &str) -> SessionResult<RoomGuard> {
        loop {
            let (generation, handle) = {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                let slot = rooms.entry(room_id.to_string()).or_insert_with(|| {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    RoomSlot {
                        generation,
                        handle: Arc::new(TokioRwLock::new(Room::new(room_id.to_string(), generation))),
                    }
                });
                (slot.generation, slot.handle.clone())
            };

            let mut room = handle.write_owned().await;
            if room.closed {
                // Closed while we waited; it is already unlinked, so the next pass creates a fresh one
                debug!("Room {} (generation {}) closed while waiting, retrying", room_id, generation);
                continue;
            }
            if room.router.is_some() {
                return Ok(room);
            }

            let engine = self.engine.clone();
            match bounded(EngineOp::CreateRouter, self.engine_timeout, &self.metrics, async move {
                engine.create_router().await
            })
            .await
            {
                Ok(router) => {
                    info!("Room {} created on worker {} (router {})", room_id, router.worker_index(), router.id());
                    room.router = Some(router);
                    self.metrics.inc(Counter::RoomsCreated);
                    return Ok(room);
                }
                Err(e) => {
                    warn!("Failed to create router for room {}: {}", room_id, e);
                    if room.is_empty() {
                        room.closed = true;
                        self.unlink(&room);
                    }
                    return Err(e);
                }
            }
        }
    }

    pub fn add_participant(&self, room: &mut Room, session: ParticipantSession) {
        {
            let mut index = self.participant_rooms.write().unwrap_or_else(|e| e.into_inner());
            index.insert(session.id.clone(), room.id.clone());
        }
        room.participants.insert(session.id.clone(), session);
    }

    /// Detaches a participant. With [`RoomRetention::CloseWhenEmpty`], removing the
    /// last participant closes the router and unlinks the room.
    ///
    /// The caller is responsible for closing the session's own resources.
    pub fn remove_participant(
        &self,
        room: &mut Room,
        participant_id: &str,
        retention: RoomRetention,
    ) -> Option<Departure> {
        let session = room.participants.remove(participant_id)?;
        {
            let mut index = self.participant_rooms.write().unwrap_or_else(|e| e.into_inner());
            if index.get(participant_id) == Some(&room.id) {
                index.remove(participant_id);
            }
        }
        let room_closed = retention == RoomRetention::CloseWhenEmpty
            && room.is_empty()
            && self.close_room(room);
        Some(Departure { session, room_closed })
    }

    /// Closes the router and unlinks the room. Remaining participants are dropped
    /// from the index and returned. Returns `false` if the room was already closed.
    pub fn close_room(&self, room: &mut Room) -> bool {
        if room.closed {
            return false;
        }
        room.closed = true;
        {
            let mut index = self.participant_rooms.write().unwrap_or_else(|e| e.into_inner());
            for id in room.participants.keys() {
                index.remove(id);
            }
        }
        if let Some(router) = room.router.take() {
            router.close();
        }
        self.unlink(room);
        self.metrics.inc(Counter::RoomsClosed);
        info!("Room {} closed", room.id);
        true
    }

    fn unlink(&self, room: &Room) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if rooms.get(&room.id).is_some_and(|slot| slot.generation == room.generation) {
            rooms.remove(&room.id);
        }
    }

    pub fn room_ids(&self) -> Vec<String> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.keys().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn participant_count(&self) -> usize {
        self.participant_rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::LoopbackOp;
    use crate::media::{LoopbackEngine, MediaConfig, MediaError};
    use crate::session::sink::testing::RecordingSink;

    fn registry() -> (Arc<RoomRegistry>, LoopbackEngine) {
        let engine = LoopbackEngine::new(MediaConfig::default());
        let registry = RoomRegistry::new(
            Arc::new(engine.clone()),
            Duration::from_millis(500),
            ServerMetrics::new(),
        );
        (Arc::new(registry), engine)
    }

    fn session(room: &mut Room, id: &str) -> ParticipantSession {
        let seq = room.next_join_seq();
        ParticipantSession::new(id.into(), id.into(), None, seq == 0, seq, RecordingSink::new())
    }

    #[tokio::test]
    async fn concurrent_creators_share_one_router() {
        let (registry, engine) = registry();
        engine.set_delay(LoopbackOp::CreateRouter, Duration::from_millis(20));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut room = registry.get_or_create_room("r1").await.unwrap();
                let s = session(&mut room, &format!("p{i}"));
                registry.add_participant(&mut room, s);
                room.router().unwrap().id()
            }));
        }
        let mut routers = Vec::new();
        for task in tasks {
            routers.push(task.await.unwrap());
        }
        routers.dedup();
        assert_eq!(routers.len(), 1);
        assert_eq!(engine.stats().routers_created, 1);
        assert_eq!(registry.participant_count(), 8);
    }

    #[tokio::test]
    async fn last_departure_closes_router_and_unlinks() {
        let (registry, engine) = registry();
        let mut room = registry.get_or_create_room("r1").await.unwrap();
        let a = session(&mut room, "a");
        let b = session(&mut room, "b");
        registry.add_participant(&mut room, a);
        registry.add_participant(&mut room, b);
        assert_eq!(registry.room_of("a").as_deref(), Some("r1"));

        let departure = registry
            .remove_participant(&mut room, "a", RoomRetention::CloseWhenEmpty)
            .unwrap();
        assert!(!departure.room_closed);
        assert_eq!(engine.stats().routers_open, 1);

        let departure = registry
            .remove_participant(&mut room, "b", RoomRetention::CloseWhenEmpty)
            .unwrap();
        assert!(departure.room_closed);
        assert_eq!(engine.stats().routers_open, 0);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.room_of("b").is_none());
        assert!(registry.remove_participant(&mut room, "b", RoomRetention::CloseWhenEmpty).is_none());
    }

    #[tokio::test]
    async fn keep_open_retains_the_router() {
        let (registry, engine) = registry();
        let mut room = registry.get_or_create_room("r1").await.unwrap();
        let a = session(&mut room, "a");
        registry.add_participant(&mut room, a);
        let departure = registry
            .remove_participant(&mut room, "a", RoomRetention::KeepOpen)
            .unwrap();
        assert!(!departure.room_closed);
        assert_eq!(engine.stats().routers_open, 1);
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn failed_router_creation_leaves_no_room() {
        let (registry, engine) = registry();
        engine.fail_next(LoopbackOp::CreateRouter, MediaError::WorkerError("dead".into()));
        let err = registry.get_or_create_room("r1").await.err().unwrap();
        assert!(matches!(err, SessionError::Engine { op: EngineOp::CreateRouter, .. }));
        assert_eq!(registry.room_count(), 0);

        let room = registry.get_or_create_room("r1").await.unwrap();
        assert!(room.router().is_ok());
    }

    #[tokio::test]
    async fn recreated_room_is_not_unlinked_by_stale_close() {
        let (registry, _engine) = registry();
        let mut old = registry.get_or_create_room("r1").await.unwrap();
        let a = session(&mut old, "a");
        registry.add_participant(&mut old, a);
        registry.remove_participant(&mut old, "a", RoomRetention::CloseWhenEmpty);
        drop(old);

        let mut fresh = registry.get_or_create_room("r1").await.unwrap();
        let b = session(&mut fresh, "b");
        registry.add_participant(&mut fresh, b);
        drop(fresh);
        assert_eq!(registry.room_count(), 1);
        assert!(registry.lock_room("r1").await.unwrap().contains("b"));
    }

    #[tokio::test]
    async fn broadcast_counts_every_attempt() {
        let (registry, _engine) = registry();
        let mut room = registry.get_or_create_room("r1").await.unwrap();
        for id in ["a", "b", "c"] {
            let mut s = session(&mut room, id);
            assert!(s.try_activate());
            registry.add_participant(&mut room, s);
        }
        let event = ServerMessage::ParticipantLeft { participant_id: "x".into() };
        let fanout = room.broadcast_except("a", &event);
        assert_eq!(fanout, Fanout { attempted: 2, failed: 0 });
        assert_eq!(room.broadcast_all(&event).attempted, 3);
    }

    #[tokio::test]
    async fn snapshot_lists_participants_in_join_order() {
        let (registry, _engine) = registry();
        let mut room = registry.get_or_create_room("r1").await.unwrap();
        for id in ["zed", "amy", "bob"] {
            let s = session(&mut room, id);
            registry.add_participant(&mut room, s);
        }
        let ids: Vec<String> = room.snapshot().participants.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["zed", "amy", "bob"]);
        assert!(room.participant("zed").unwrap().moderator);
    }
}
