//! Session request handler
//!
//! Applies client requests, room events and transport notices to one
//! session's state, in the order the session task receives them.

use std::sync::Arc;

use serde_json::Value;

use super::state::SessionState;
use super::SessionId;
use crate::engine::{DtlsState, MediaKind, ProducerId};
use crate::error::{Direction, Result};
use crate::protocol::{
    ConnectTransportParams, ConsumeParams, CreateTransportParams, ProduceParams, ProduceResponse,
    Request, ResumeParams, ServerEvent,
};
use crate::registry::{RoomEvent, RoomEventKind, TransportNotice};
use crate::room::Room;

/// Drives one session against the room
pub struct SessionHandler {
    room: Arc<Room>,
    state: SessionState,
}

impl SessionHandler {
    pub fn new(room: Arc<Room>, state: SessionState) -> Self {
        Self { room, state }
    }

    pub fn id(&self) -> SessionId {
        self.state.id()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Announcements of the producers already live when the session joined
    pub async fn greeting(&self) -> Vec<ServerEvent> {
        self.room
            .production
            .current_producers()
            .await
            .into_iter()
            .filter(|p| p.session_id != self.state.id())
            .map(|p| ServerEvent::NewProducer {
                producer_id: p.id,
                kind: p.kind,
            })
            .collect()
    }

    /// Apply one request, returning the response payload
    pub async fn handle(&mut self, request: Request) -> Result<Value> {
        tracing::debug!(
            session_id = self.state.id(),
            method = request.method(),
            "Handling request"
        );

        match request {
            Request::GetRouterRtpCapabilities => {
                Ok(serde_json::to_value(self.room.capabilities.get())?)
            }
            Request::CreateProducerTransport(params) => {
                self.create_transport(Direction::Send, params).await
            }
            Request::CreateConsumerTransport(params) => {
                self.create_transport(Direction::Recv, params).await
            }
            Request::ConnectProducerTransport(params) => {
                self.connect_transport(Direction::Send, params).await
            }
            Request::ConnectConsumerTransport(params) => {
                self.connect_transport(Direction::Recv, params).await
            }
            Request::Produce(params) => self.produce(params).await,
            Request::Consume(params) => self.consume(params).await,
            Request::Resume(params) => self.resume(params).await,
        }
    }

    async fn create_transport(
        &mut self,
        direction: Direction,
        params: CreateTransportParams,
    ) -> Result<Value> {
        if let Some(capabilities) = params.rtp_capabilities {
            self.state.device_capabilities = Some(capabilities);
        }
        if self.state.transport(direction).is_some() {
            tracing::info!(
                session_id = self.state.id(),
                direction = %direction,
                "Replacing existing transport"
            );
            self.release_direction(direction).await;
        }

        let parameters = self
            .room
            .transports
            .create(&mut self.state, direction, params.force_tcp)
            .await?;
        Ok(serde_json::to_value(parameters)?)
    }

    async fn connect_transport(
        &mut self,
        direction: Direction,
        params: ConnectTransportParams,
    ) -> Result<Value> {
        self.room
            .transports
            .connect(
                &mut self.state,
                direction,
                params.transport_id.as_ref(),
                params.dtls_parameters,
            )
            .await?;
        Ok(Value::Null)
    }

    async fn produce(&mut self, params: ProduceParams) -> Result<Value> {
        let id = self
            .room
            .production
            .produce(
                &mut self.state,
                params.transport_id.as_ref(),
                params.kind,
                params.rtp_parameters,
            )
            .await?;
        Ok(serde_json::to_value(ProduceResponse { id })?)
    }

    async fn consume(&mut self, params: ConsumeParams) -> Result<Value> {
        let descriptor = self
            .room
            .consumption
            .consume(
                &mut self.state,
                params.producer_id.as_ref(),
                params.kind,
                &params.rtp_capabilities,
            )
            .await?;
        Ok(serde_json::to_value(descriptor)?)
    }

    async fn resume(&mut self, params: ResumeParams) -> Result<Value> {
        self.room
            .consumption
            .resume(&mut self.state, params.consumer_id.as_ref())
            .await?;
        Ok(Value::Null)
    }

    /// Apply a room event, returning what to tell the client
    pub fn on_room_event(&mut self, event: &RoomEvent) -> Option<ServerEvent> {
        if !self.state.wants(event) {
            return None;
        }

        if let RoomEventKind::ProducerClosed { producer_id, .. } = &event.kind {
            let released = self
                .room
                .consumption
                .release_for_producer(&mut self.state, producer_id);
            if released > 0 {
                tracing::debug!(
                    session_id = self.state.id(),
                    producer_id = %producer_id,
                    released = released,
                    "Consumers released after producer closed"
                );
            }
        }

        if event.origin == self.state.id() {
            return None;
        }
        Some(event.to_server_event())
    }

    /// Reconcile with the room after missing events
    ///
    /// Consumers of producers that are gone are released and reported with
    /// `producerClosed`; live producers of kinds the session does not consume
    /// are announced again with `newProducer`.
    pub async fn resync(&mut self) -> Vec<ServerEvent> {
        let current = self.room.production.current_producers().await;
        let mut stale: Vec<(ProducerId, MediaKind)> = Vec::new();
        for consumer in self.state.consumers().values() {
            let producer_id = consumer.producer_id();
            let live = current.iter().any(|p| p.id == producer_id);
            if !live && !stale.iter().any(|(id, _)| *id == producer_id) {
                stale.push((producer_id, consumer.kind()));
            }
        }

        let mut delivered = Vec::new();
        for (producer_id, kind) in stale {
            let released = self
                .room
                .consumption
                .release_for_producer(&mut self.state, &producer_id);
            if released > 0 {
                delivered.push(ServerEvent::ProducerClosed { producer_id, kind });
            }
        }
        for producer in current {
            if producer.session_id != self.state.id() && !self.state.consumes_kind(producer.kind) {
                delivered.push(ServerEvent::NewProducer {
                    producer_id: producer.id,
                    kind: producer.kind,
                });
            }
        }

        tracing::info!(
            session_id = self.state.id(),
            events = delivered.len(),
            "Session resynced with room"
        );
        delivered
    }

    /// Apply an engine-reported transport state change
    pub async fn on_transport_notice(&mut self, notice: TransportNotice) {
        let is_current = self
            .state
            .transport(notice.direction)
            .map_or(false, |t| t.id() == notice.transport_id);
        if !is_current {
            return;
        }

        match notice.state {
            DtlsState::Failed | DtlsState::Closed => {
                tracing::warn!(
                    session_id = self.state.id(),
                    transport_id = %notice.transport_id,
                    direction = %notice.direction,
                    state = ?notice.state,
                    "Transport lost, releasing its objects"
                );
                self.release_direction(notice.direction).await;
            }
            state => {
                tracing::debug!(
                    session_id = self.state.id(),
                    transport_id = %notice.transport_id,
                    state = ?state,
                    "Transport DTLS state changed"
                );
            }
        }
    }

    /// Close a transport together with the producers or consumers on it
    async fn release_direction(&mut self, direction: Direction) {
        match direction {
            Direction::Send => {
                self.room.production.release_session(&mut self.state).await;
            }
            Direction::Recv => {
                self.room.consumption.release_all(&mut self.state);
            }
        }
        if let Some(entry) = self.state.take_transport(direction) {
            self.room.transports.close(entry);
        }
    }

    /// Tear the session down
    ///
    /// Consumers go first, then producers (announced with `producerClosed`),
    /// then both transports.
    pub async fn close(mut self) {
        let consumers = self.room.consumption.release_all(&mut self.state);
        let producers = self.room.production.release_session(&mut self.state).await;
        for direction in [Direction::Send, Direction::Recv] {
            if let Some(entry) = self.state.take_transport(direction) {
                self.room.transports.close(entry);
            }
        }
        self.room.stats().session_closed();

        tracing::info!(
            session_id = self.state.id(),
            consumers = consumers,
            producers = producers,
            duration_ms = self.state.duration().as_millis() as u64,
            "Session closed"
        );
    }
}
