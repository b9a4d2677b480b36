//! Production manager
//!
//! Owns the room's current producer per media kind. Every write to the
//! producer map happens under one async mutex, held across the engine's
//! `produce` call, so two sessions racing for the same kind are serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};

use super::bounded;
use super::event::RoomEvent;
use super::transport::TransportState;
use crate::engine::{EngineProducer, MediaKind, ProducerId, RtpParameters, TransportId};
use crate::error::{Direction, Error, Result};
use crate::session::{SessionId, SessionState};
use crate::stats::RoomStats;

/// A live producer as seen by the rest of the room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRef {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub session_id: SessionId,
    pub paused: bool,
}

struct ProducerEntry {
    producer: Arc<dyn EngineProducer>,
    session_id: SessionId,
    transport_id: TransportId,
    created_at: Instant,
}

impl ProducerEntry {
    fn to_ref(&self) -> ProducerRef {
        ProducerRef {
            id: self.producer.id(),
            kind: self.producer.kind(),
            session_id: self.session_id,
            paused: self.producer.paused(),
        }
    }
}

/// Accepts productions and announces them to the room
pub struct ProductionManager {
    producers: Mutex<HashMap<MediaKind, ProducerEntry>>,
    events: broadcast::Sender<RoomEvent>,
    engine_timeout: Duration,
    stats: Arc<RoomStats>,
}

impl ProductionManager {
    pub fn new(event_capacity: usize, engine_timeout: Duration, stats: Arc<RoomStats>) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            producers: Mutex::new(HashMap::new()),
            events,
            engine_timeout,
            stats,
        }
    }

    /// Receive room events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Create a producer on the session's send transport
    ///
    /// The send transport must have been connected. If its DTLS handshake is
    /// still running, this waits for it up to the engine timeout.
    pub async fn produce(
        &self,
        session: &mut SessionState,
        transport_id: Option<&TransportId>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let session_id = session.id();
        let entry = session
            .transport(Direction::Send)
            .ok_or(Error::NoSendTransport)?;

        if let Some(id) = transport_id {
            if *id != entry.id() {
                return Err(Error::UnknownTransport {
                    direction: Direction::Send,
                    id: id.clone(),
                });
            }
        }

        match entry.state() {
            TransportState::Connected => {}
            TransportState::Connecting => entry.wait_connected(self.engine_timeout).await?,
            TransportState::New => return Err(Error::TransportNotConnected(entry.id())),
            TransportState::Failed | TransportState::Closed => {
                return Err(Error::TransportUnusable(entry.id()))
            }
        }

        let _negotiation = entry.begin_negotiation()?;
        let transport = Arc::clone(entry.transport());
        let transport_id = entry.id();

        let mut producers = self.producers.lock().await;
        if let Some(current) = producers.get(&kind) {
            if current.session_id != session_id {
                tracing::warn!(
                    session_id = session_id,
                    kind = %kind,
                    owner = current.session_id,
                    "Produce rejected, kind already published"
                );
                return Err(Error::KindAlreadyPublished(kind));
            }
        }

        let producer = bounded(
            "produce",
            self.engine_timeout,
            transport.produce(kind, rtp_parameters),
        )
        .await?;
        let producer_id = producer.id();
        self.stats.producer_created();

        // Same session producing the kind again: retire its old producer
        let replaced = producers.insert(
            kind,
            ProducerEntry {
                producer,
                session_id,
                transport_id: transport_id.clone(),
                created_at: Instant::now(),
            },
        );
        if let Some(old) = replaced {
            self.retire(old);
        }
        drop(producers);

        session.record_producer(kind, producer_id.clone());
        let receivers = self.publish(RoomEvent::new_producer(
            session_id,
            producer_id.clone(),
            kind,
        ));

        tracing::info!(
            session_id = session_id,
            producer_id = %producer_id,
            transport_id = %transport_id,
            kind = %kind,
            receivers = receivers,
            "Producer created"
        );

        Ok(producer_id)
    }

    /// The room's current producer of `kind`
    pub async fn get_current_producer(&self, kind: MediaKind) -> Option<ProducerRef> {
        self.producers.lock().await.get(&kind).map(ProducerEntry::to_ref)
    }

    /// Look a live producer up by id
    pub async fn get_producer(&self, producer_id: &ProducerId) -> Option<ProducerRef> {
        self.producers
            .lock()
            .await
            .values()
            .find(|entry| entry.producer.id() == *producer_id)
            .map(ProducerEntry::to_ref)
    }

    /// All current producers, video first
    pub async fn current_producers(&self) -> Vec<ProducerRef> {
        let producers = self.producers.lock().await;
        MediaKind::ALL
            .iter()
            .filter_map(|kind| producers.get(kind).map(ProducerEntry::to_ref))
            .collect()
    }

    /// Close every producer the session published
    ///
    /// Each closure is announced with `producerClosed`. Returns the number of
    /// producers closed.
    pub async fn release_session(&self, session: &mut SessionState) -> usize {
        let owned = session.take_producers();
        if owned.is_empty() {
            return 0;
        }

        let mut producers = self.producers.lock().await;
        let mut released = 0;
        for (kind, producer_id) in owned {
            let is_current = producers
                .get(&kind)
                .map_or(false, |entry| entry.producer.id() == producer_id);
            if !is_current {
                continue;
            }
            if let Some(entry) = producers.remove(&kind) {
                self.retire(entry);
                released += 1;
            }
        }
        released
    }

    fn retire(&self, entry: ProducerEntry) {
        let producer_id = entry.producer.id();
        let kind = entry.producer.kind();
        entry.producer.close();
        self.stats.producer_closed();

        let receivers = self.publish(RoomEvent::producer_closed(
            entry.session_id,
            producer_id.clone(),
            kind,
        ));

        tracing::info!(
            session_id = entry.session_id,
            producer_id = %producer_id,
            transport_id = %entry.transport_id,
            kind = %kind,
            lifetime_ms = entry.created_at.elapsed().as_millis() as u64,
            receivers = receivers,
            "Producer closed"
        );
    }

    /// Fan an event out to every session
    ///
    /// Never blocks and never fails: with no live receivers the event is
    /// simply dropped.
    fn publish(&self, event: RoomEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}
