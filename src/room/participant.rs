#![forbid(unsafe_code)]

// A participant's membership in one room and the media resources it owns

use crate::media::{MediaConsumer, MediaKind, MediaProducer, MediaTransport};
use crate::session::errors::{Resource, SessionError, SessionResult};
use crate::session::sink::{EventSink, PushError};
use crate::signaling::protocol::{ParticipantInfo, ParticipantStatus, ServerMessage};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Pending,
    Connecting,
    Connected,
}

pub struct TransportEntry {
    pub id: String,
    pub handle: Arc<dyn MediaTransport>,
    pub producing: bool,
    pub consuming: bool,
    pub state: TransportState,
    created_seq: u64,
}

pub struct ProducerEntry {
    pub id: String,
    pub handle: Arc<dyn MediaProducer>,
    pub transport_id: String,
    pub kind: MediaKind,
    pub is_screen_share: bool,
}

pub struct ConsumerEntry {
    pub id: String,
    pub handle: Arc<dyn MediaConsumer>,
    pub transport_id: String,
    pub producer_id: String,
    pub source_participant_id: String,
    pub kind: MediaKind,
    pub resumed: bool,
}

/// Resources released by [`ParticipantSession::close_all`]
#[derive(Debug, Default)]
pub struct ClosedResources {
    pub producer_ids: Vec<String>,
    pub consumers: usize,
    pub transports: usize,
}

enum Phase {
    /// Join reply not yet delivered; pushes wait here
    Joining(Vec<ServerMessage>),
    Active,
}

pub struct ParticipantSession {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub moderator: bool,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
    pub join_seq: u64,
    sink: Arc<dyn EventSink>,
    phase: Phase,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
    next_transport_seq: u64,
}

impl ParticipantSession {
    pub fn new(
        id: String,
        display_name: String,
        email: Option<String>,
        moderator: bool,
        join_seq: u64,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            id,
            display_name,
            email,
            audio_enabled: false,
            video_enabled: false,
            screen_sharing: false,
            moderator,
            status: ParticipantStatus::Active,
            joined_at: Utc::now(),
            join_seq,
            sink,
            phase: Phase::Joining(Vec::new()),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            next_transport_seq: 0,
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            is_screen_sharing: self.screen_sharing,
            is_moderator: self.moderator,
            joined_at: self.joined_at,
            status: self.status,
        }
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Active)
    }

    /// Delivers `message`, or holds it until [`activate`](Self::activate) while joining.
    pub fn push(&mut self, message: &ServerMessage) -> Result<(), PushError> {
        match &mut self.phase {
            Phase::Joining(pending) => {
                pending.push(message.clone());
                Ok(())
            }
            Phase::Active => self.sink.push(message),
        }
    }

    /// Takes the pushes held so far. The session stays in the joining phase,
    /// so anything pushed meanwhile is held behind them.
    pub fn take_held(&mut self) -> Vec<ServerMessage> {
        match &mut self.phase {
            Phase::Joining(pending) => std::mem::take(pending),
            Phase::Active => Vec::new(),
        }
    }

    /// Switches to direct delivery once nothing is held. Returns whether it did.
    pub fn try_activate(&mut self) -> bool {
        if let Phase::Joining(pending) = &self.phase {
            if !pending.is_empty() {
                return false;
            }
            self.phase = Phase::Active;
        }
        true
    }

    pub fn insert_transport(
        &mut self,
        handle: Arc<dyn MediaTransport>,
        producing: bool,
        consuming: bool,
    ) -> &TransportEntry {
        let id = handle.id();
        let created_seq = self.next_transport_seq;
        self.next_transport_seq += 1;
        self.transports.entry(id.clone()).or_insert(TransportEntry {
            id,
            handle,
            producing,
            consuming,
            state: TransportState::Pending,
            created_seq,
        })
    }

    pub fn transport(&self, transport_id: &str) -> SessionResult<&TransportEntry> {
        self.transports
            .get(transport_id)
            .ok_or_else(|| SessionError::not_found(Resource::Transport, transport_id))
    }

    pub fn transport_mut(&mut self, transport_id: &str) -> SessionResult<&mut TransportEntry> {
        self.transports
            .get_mut(transport_id)
            .ok_or_else(|| SessionError::not_found(Resource::Transport, transport_id))
    }

    /// Oldest transport created for consuming
    pub fn default_consuming_transport(&self) -> Option<&TransportEntry> {
        self.transports
            .values()
            .filter(|t| t.consuming)
            .min_by_key(|t| t.created_seq)
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub fn insert_producer(&mut self, entry: ProducerEntry) -> SessionResult<()> {
        self.transport(&entry.transport_id)?;
        self.producers.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn producer(&self, producer_id: &str) -> Option<&ProducerEntry> {
        self.producers.get(producer_id)
    }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerEntry> {
        self.producers.values()
    }

    pub fn remove_producer(&mut self, producer_id: &str) -> Option<ProducerEntry> {
        self.producers.remove(producer_id)
    }

    pub fn insert_consumer(&mut self, entry: ConsumerEntry) -> SessionResult<()> {
        self.transport(&entry.transport_id)?;
        self.consumers.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn consumer(&self, consumer_id: &str) -> SessionResult<&ConsumerEntry> {
        self.consumers
            .get(consumer_id)
            .ok_or_else(|| SessionError::not_found(Resource::Consumer, consumer_id))
    }

    pub fn consumer_mut(&mut self, consumer_id: &str) -> SessionResult<&mut ConsumerEntry> {
        self.consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SessionError::not_found(Resource::Consumer, consumer_id))
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Closes and forgets every consumer fed by `producer_id`.
    pub fn close_consumers_of(&mut self, producer_id: &str) -> usize {
        let ids: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            if let Some(consumer) = self.consumers.remove(id) {
                consumer.handle.close();
            }
        }
        ids.len()
    }

    /// Closes every owned consumer, producer and transport, in that order.
    /// Calling it again closes nothing.
    pub fn close_all(&mut self) -> ClosedResources {
        let mut closed = ClosedResources::default();
        for (_, consumer) in self.consumers.drain() {
            consumer.handle.close();
            closed.consumers += 1;
        }
        for (id, producer) in self.producers.drain() {
            producer.handle.close();
            closed.producer_ids.push(id);
        }
        for (_, transport) in self.transports.drain() {
            transport.handle.close();
            closed.transports += 1;
        }
        closed
    }
}
