//! Session state
//!
//! Everything one signaling connection owns: its two transports, its
//! consumers and the ids of the producers it published. The state is only
//! touched from the session's own task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc;

use super::SessionId;
use crate::engine::{ConsumerId, MediaKind, ProducerId, RtpCapabilities};
use crate::error::Direction;
use crate::registry::{
    ConsumerEntry, RoomEvent, RoomEventKind, TransportEntry, TransportNotice, TransportState,
};

/// Progress along the publishing axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPhase {
    /// No send transport
    Idle,
    /// Send transport created, DTLS not yet connected
    TransportCreated,
    /// Send transport connected (or connecting), nothing produced
    TransportConnected,
    /// At least one producer live
    Producing,
}

/// Progress along the subscribing axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribePhase {
    /// No receive transport
    Idle,
    /// Receive transport created, no consumer
    TransportCreated,
    /// Consumers exist, at least one still paused
    Consuming,
    /// Every consumer is flowing
    Resumed,
}

/// Complete session state
pub struct SessionState {
    id: SessionId,

    /// Remote peer address, when known
    pub peer_addr: Option<SocketAddr>,

    /// Connection start time
    pub connected_at: Instant,

    /// Device capabilities reported by a publishing client
    pub device_capabilities: Option<RtpCapabilities>,

    send: Option<TransportEntry>,
    recv: Option<TransportEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    producers: HashMap<MediaKind, ProducerId>,
    notices: mpsc::UnboundedSender<TransportNotice>,
}

impl SessionState {
    /// Create a new session state
    ///
    /// The receiver yields engine-reported DTLS changes of the session's
    /// transports and must be drained by the session task.
    pub fn new(
        id: SessionId,
        peer_addr: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportNotice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let state = Self {
            id,
            peer_addr,
            connected_at: Instant::now(),
            device_capabilities: None,
            send: None,
            recv: None,
            consumers: HashMap::new(),
            producers: HashMap::new(),
            notices,
        };
        (state, notices_rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn notice_sender(&self) -> mpsc::UnboundedSender<TransportNotice> {
        self.notices.clone()
    }

    pub fn transport(&self, direction: Direction) -> Option<&TransportEntry> {
        match direction {
            Direction::Send => self.send.as_ref(),
            Direction::Recv => self.recv.as_ref(),
        }
    }

    pub fn transport_mut(&mut self, direction: Direction) -> Option<&mut TransportEntry> {
        match direction {
            Direction::Send => self.send.as_mut(),
            Direction::Recv => self.recv.as_mut(),
        }
    }

    /// Store a transport under its direction, returning the one it displaced
    pub fn set_transport(&mut self, entry: TransportEntry) -> Option<TransportEntry> {
        match entry.direction() {
            Direction::Send => self.send.replace(entry),
            Direction::Recv => self.recv.replace(entry),
        }
    }

    pub fn take_transport(&mut self, direction: Direction) -> Option<TransportEntry> {
        match direction {
            Direction::Send => self.send.take(),
            Direction::Recv => self.recv.take(),
        }
    }

    pub fn producer(&self, kind: MediaKind) -> Option<&ProducerId> {
        self.producers.get(&kind)
    }

    pub fn producers(&self) -> &HashMap<MediaKind, ProducerId> {
        &self.producers
    }

    pub(crate) fn record_producer(&mut self, kind: MediaKind, producer_id: ProducerId) {
        self.producers.insert(kind, producer_id);
    }

    pub(crate) fn take_producers(&mut self) -> HashMap<MediaKind, ProducerId> {
        std::mem::take(&mut self.producers)
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<&ConsumerEntry> {
        self.consumers.get(consumer_id)
    }

    pub fn consumers(&self) -> &HashMap<ConsumerId, ConsumerEntry> {
        &self.consumers
    }

    /// Whether the session consumes any producer of `kind`
    pub fn consumes_kind(&self, kind: MediaKind) -> bool {
        self.consumers.values().any(|c| c.kind() == kind)
    }

    /// Add a consumer, displacing the session's consumer of the same producer
    pub(crate) fn insert_consumer(&mut self, entry: ConsumerEntry) -> Option<ConsumerEntry> {
        let producer_id = entry.producer_id();
        let previous_id = self
            .consumers
            .iter()
            .find(|(_, c)| c.producer_id() == producer_id)
            .map(|(id, _)| id.clone());
        let previous = previous_id.and_then(|id| self.consumers.remove(&id));
        self.consumers.insert(entry.id(), entry);
        previous
    }

    pub(crate) fn remove_consumers_of(&mut self, producer_id: &ProducerId) -> Vec<ConsumerEntry> {
        let ids: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id() == *producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.consumers.remove(id))
            .collect()
    }

    pub(crate) fn take_consumers(&mut self) -> Vec<ConsumerEntry> {
        self.consumers.drain().map(|(_, c)| c).collect()
    }

    pub fn publish_phase(&self) -> PublishPhase {
        match &self.send {
            None => PublishPhase::Idle,
            Some(_) if !self.producers.is_empty() => PublishPhase::Producing,
            Some(t) if t.state() == TransportState::New => PublishPhase::TransportCreated,
            Some(_) => PublishPhase::TransportConnected,
        }
    }

    pub fn subscribe_phase(&self) -> SubscribePhase {
        match &self.recv {
            None => SubscribePhase::Idle,
            Some(_) if self.consumers.is_empty() => SubscribePhase::TransportCreated,
            Some(_) if self.consumers.values().any(|c| c.paused()) => SubscribePhase::Consuming,
            Some(_) => SubscribePhase::Resumed,
        }
    }

    /// Whether a room event concerns this session
    ///
    /// `newProducer` goes to every other session not already consuming the
    /// kind. `producerClosed` goes to every other session, and to this one
    /// only when it holds consumers of the producer.
    pub fn wants(&self, event: &RoomEvent) -> bool {
        match &event.kind {
            RoomEventKind::NewProducer { kind, .. } => {
                event.origin != self.id && !self.consumes_kind(*kind)
            }
            RoomEventKind::ProducerClosed { producer_id, .. } => {
                event.origin != self.id
                    || self.consumers.values().any(|c| c.producer_id() == *producer_id)
            }
        }
    }

    /// Session duration
    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("send", &self.send)
            .field("recv", &self.recv)
            .field("consumers", &self.consumers.len())
            .field("producers", &self.producers)
            .finish()
    }
}
