//! Room events fanned out to sessions
//!
//! Events go through a `tokio::sync::broadcast` channel: publishing never
//! blocks, and a session that falls behind loses the oldest events instead of
//! stalling the producer.

use crate::engine::{MediaKind, ProducerId};
use crate::protocol::ServerEvent;
use crate::session::SessionId;

/// What happened in the room
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEventKind {
    /// A producer became the room's current producer for its kind
    NewProducer {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    /// A producer was closed (replaced, or its session went away)
    ProducerClosed {
        producer_id: ProducerId,
        kind: MediaKind,
    },
}

/// A room event tagged with the session that caused it
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEvent {
    pub origin: SessionId,
    pub kind: RoomEventKind,
}

impl RoomEvent {
    pub fn new_producer(origin: SessionId, producer_id: ProducerId, kind: MediaKind) -> Self {
        Self {
            origin,
            kind: RoomEventKind::NewProducer { producer_id, kind },
        }
    }

    pub fn producer_closed(origin: SessionId, producer_id: ProducerId, kind: MediaKind) -> Self {
        Self {
            origin,
            kind: RoomEventKind::ProducerClosed { producer_id, kind },
        }
    }

    /// Client-facing form of the event
    pub fn to_server_event(&self) -> ServerEvent {
        match &self.kind {
            RoomEventKind::NewProducer { producer_id, kind } => ServerEvent::NewProducer {
                producer_id: producer_id.clone(),
                kind: *kind,
            },
            RoomEventKind::ProducerClosed { producer_id, kind } => ServerEvent::ProducerClosed {
                producer_id: producer_id.clone(),
                kind: *kind,
            },
        }
    }
}
