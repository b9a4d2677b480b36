//! Media engine seam
//!
//! The coordinator never touches RTP, ICE or DTLS itself. Everything below the
//! signaling layer is delegated to an SFU-style media engine with a
//! router → transport → producer/consumer object model:
//!
//! ```text
//!   MediaEngine (router scope)
//!     ├── rtp_capabilities / can_consume
//!     └── create_webrtc_transport ──► EngineTransport
//!                                       ├── connect(dtls)
//!                                       ├── produce ──► EngineProducer
//!                                       └── consume ──► EngineConsumer
//!                                                         ├── resume
//!                                                         └── set_preferred_layers
//! ```
//!
//! Engine objects are closed explicitly by the coordinator, exactly once each.
//! Implementations must tolerate `close()` on an object the engine already
//! tore down on its own (e.g. a consumer whose producer went away).

pub mod error;
pub mod memory;
#[cfg(feature = "mediasoup")]
pub mod mediasoup;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

pub use error::EngineError;
pub use memory::InMemoryEngine;
pub use types::{
    ConsumerId, ConsumerLayers, ConsumerType, DtlsParameters, DtlsState, IceCandidates,
    IceParameters, ListenIp, MediaKind, ProducerId, RtpCapabilities, RtpParameters, TransportId,
    TransportParameters, WebRtcTransportOptions,
};

/// Liveness of the engine worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHealth {
    Running,
    /// The worker exited; the process cannot keep serving
    Died(String),
}

/// Router-scoped entry point into the media engine
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Negotiated RTP capabilities of the router
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Allocate a WebRTC transport on the router
    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;

    /// Watch the worker's liveness
    fn health(&self) -> watch::Receiver<EngineHealth>;
}

/// A WebRTC transport allocated by the engine
#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// ICE/DTLS material to relay to the client
    fn parameters(&self) -> TransportParameters;

    /// Watch the DTLS state as reported by the engine
    fn dtls_state(&self) -> watch::Receiver<DtlsState>;

    /// Supply the remote DTLS parameters
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    /// Cap the bitrate the remote side may send on this transport
    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError>;

    fn close(&self);
}

/// An inbound track on a send transport
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    fn close(&self);
}

/// An outbound forwarding of a producer on a receive transport
#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn consumer_type(&self) -> ConsumerType;
    fn paused(&self) -> bool;
    fn producer_paused(&self) -> bool;
    async fn resume(&self) -> Result<(), EngineError>;
    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), EngineError>;
    fn close(&self);
}
