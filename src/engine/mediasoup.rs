//! mediasoup-backed media engine
//!
//! One worker and one router per process. Opaque JSON parameters from the
//! signaling layer are converted to mediasoup's typed structures through
//! serde, so whatever the browser library sends is validated by mediasoup
//! itself.
//!
//! mediasoup closes objects when their last handle drops, so every adapter
//! keeps its handle in an `Option` and `close()` takes it out.

use std::num::{NonZeroU32, NonZeroU8};
use std::sync::Arc;

use async_trait::async_trait;
use mediasoup::prelude as ms;
use mediasoup::prelude::Transport as _;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use super::error::EngineError;
use super::types::*;
use super::{EngineConsumer, EngineHealth, EngineProducer, EngineTransport, MediaEngine};
use crate::error::{Error, Result};
use crate::server::config::MediaConfig;

/// Re-type a value through its JSON form
fn convert<T: Serialize, U: DeserializeOwned>(value: &T) -> std::result::Result<U, EngineError> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| EngineError::rejected(format!("invalid parameters: {}", e)))
}

fn rejected(e: impl std::fmt::Display) -> EngineError {
    EngineError::rejected(e.to_string())
}

fn dtls_state(state: ms::DtlsState) -> DtlsState {
    match state {
        ms::DtlsState::New => DtlsState::New,
        ms::DtlsState::Connecting => DtlsState::Connecting,
        ms::DtlsState::Connected => DtlsState::Connected,
        ms::DtlsState::Failed => DtlsState::Failed,
        ms::DtlsState::Closed => DtlsState::Closed,
    }
}

fn media_kind(kind: ms::MediaKind) -> MediaKind {
    match kind {
        ms::MediaKind::Audio => MediaKind::Audio,
        ms::MediaKind::Video => MediaKind::Video,
    }
}

/// Router codecs: Opus, VP8 and H264 constrained baseline
fn media_codecs() -> Vec<ms::RtpCodecCapability> {
    let clock_rate = |hz| NonZeroU32::new(hz).unwrap_or(NonZeroU32::MIN);
    vec![
        ms::RtpCodecCapability::Audio {
            mime_type: ms::MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: clock_rate(48000),
            channels: NonZeroU8::new(2).unwrap_or(NonZeroU8::MIN),
            parameters: ms::RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![ms::RtcpFeedback::TransportCc],
        },
        ms::RtpCodecCapability::Video {
            mime_type: ms::MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: clock_rate(90000),
            parameters: ms::RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![
                ms::RtcpFeedback::Nack,
                ms::RtcpFeedback::NackPli,
                ms::RtcpFeedback::CcmFir,
                ms::RtcpFeedback::GoogRemb,
                ms::RtcpFeedback::TransportCc,
            ],
        },
        ms::RtpCodecCapability::Video {
            mime_type: ms::MimeTypeVideo::H264,
            preferred_payload_type: None,
            clock_rate: clock_rate(90000),
            parameters: ms::RtpCodecParametersParameters::from([
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
                ("level-asymmetry-allowed", 1_u32.into()),
            ]),
            rtcp_feedback: vec![
                ms::RtcpFeedback::Nack,
                ms::RtcpFeedback::NackPli,
                ms::RtcpFeedback::CcmFir,
                ms::RtcpFeedback::GoogRemb,
                ms::RtcpFeedback::TransportCc,
            ],
        },
    ]
}

fn log_level(name: &str) -> Result<WorkerLogLevel> {
    match name {
        "debug" => Ok(WorkerLogLevel::Debug),
        "warn" => Ok(WorkerLogLevel::Warn),
        "error" => Ok(WorkerLogLevel::Error),
        "none" => Ok(WorkerLogLevel::None),
        other => Err(Error::Config(format!("unknown worker log level: {}", other))),
    }
}

fn log_tag(name: &str) -> Result<WorkerLogTag> {
    let tag = match name {
        "info" => WorkerLogTag::Info,
        "ice" => WorkerLogTag::Ice,
        "dtls" => WorkerLogTag::Dtls,
        "rtp" => WorkerLogTag::Rtp,
        "srtp" => WorkerLogTag::Srtp,
        "rtcp" => WorkerLogTag::Rtcp,
        "rtx" => WorkerLogTag::Rtx,
        "bwe" => WorkerLogTag::Bwe,
        "score" => WorkerLogTag::Score,
        "simulcast" => WorkerLogTag::Simulcast,
        "svc" => WorkerLogTag::Svc,
        "sctp" => WorkerLogTag::Sctp,
        "message" => WorkerLogTag::Message,
        other => return Err(Error::Config(format!("unknown worker log tag: {}", other))),
    };
    Ok(tag)
}

/// Media engine running a mediasoup worker
pub struct MediasoupEngine {
    _worker_manager: ms::WorkerManager,
    _worker: ms::Worker,
    router: ms::Router,
    rtc_ports: std::ops::RangeInclusive<u16>,
    health: Arc<watch::Sender<EngineHealth>>,
    _dead_handler: ms::HandlerId,
}

impl MediasoupEngine {
    /// Start the worker and its router
    ///
    /// Failure here is a configuration failure: the process cannot serve.
    pub async fn start(config: &MediaConfig) -> Result<Self> {
        let worker_manager = ms::WorkerManager::new();

        let mut settings = ms::WorkerSettings::default();
        settings.log_level = log_level(&config.worker_log_level)?;
        settings.log_tags = config
            .worker_log_tags
            .iter()
            .map(|tag| log_tag(tag))
            .collect::<Result<_>>()?;

        let worker = worker_manager
            .create_worker(settings)
            .await
            .map_err(|e| Error::Config(format!("failed to start media worker: {}", e)))?;

        let (health, _) = watch::channel(EngineHealth::Running);
        let health = Arc::new(health);
        let dead_tx = Arc::clone(&health);
        let dead_handler = worker.on_dead(move |reason| {
            let reason = match reason {
                Ok(()) => "worker exited".to_string(),
                Err(e) => e.to_string(),
            };
            dead_tx.send_replace(EngineHealth::Died(reason));
        });

        let router = worker
            .create_router(ms::RouterOptions::new(media_codecs()))
            .await
            .map_err(|e| Error::Config(format!("failed to create router: {}", e)))?;

        tracing::info!(
            worker_id = %worker.id(),
            router_id = %router.id(),
            "mediasoup worker started"
        );

        Ok(Self {
            _worker_manager: worker_manager,
            _worker: worker,
            router,
            rtc_ports: config.rtc_ports.clone(),
            health,
            _dead_handler: dead_handler,
        })
    }

    fn listen_infos(&self, options: &WebRtcTransportOptions) -> Vec<ms::ListenInfo> {
        let mut protocols = Vec::new();
        if options.enable_udp {
            protocols.push(ms::Protocol::Udp);
        }
        if options.enable_tcp {
            protocols.push(ms::Protocol::Tcp);
        }
        if !options.prefer_udp {
            protocols.reverse();
        }

        options
            .listen_ips
            .iter()
            .flat_map(|listen| {
                protocols.iter().map(move |protocol| ms::ListenInfo {
                    protocol: *protocol,
                    ip: listen.ip,
                    announced_address: listen.announced_ip.clone(),
                    expose_internal_ip: false,
                    port: None,
                    port_range: Some(self.rtc_ports.clone()),
                    flags: None,
                    send_buffer_size: None,
                    recv_buffer_size: None,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        serde_json::to_value(self.router.rtp_capabilities())
            .map(RtpCapabilities)
            .unwrap_or_default()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Ok(producer_id) = convert::<_, ms::ProducerId>(producer_id) else {
            return false;
        };
        let Ok(capabilities) = convert::<_, ms::RtpCapabilities>(rtp_capabilities) else {
            return false;
        };
        self.router.can_consume(&producer_id, &capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> std::result::Result<Arc<dyn EngineTransport>, EngineError> {
        let mut infos = self.listen_infos(&options).into_iter();
        let first = infos
            .next()
            .ok_or_else(|| EngineError::rejected("no listen address or protocol enabled"))?;
        let mut listen_infos = ms::WebRtcTransportListenInfos::new(first);
        for info in infos {
            listen_infos = listen_infos.insert(info);
        }

        let mut transport_options = ms::WebRtcTransportOptions::new(listen_infos);
        transport_options.enable_udp = options.enable_udp;
        transport_options.enable_tcp = options.enable_tcp;
        transport_options.prefer_udp = options.prefer_udp;
        transport_options.initial_available_outgoing_bitrate =
            options.initial_available_outgoing_bitrate;

        let transport = self
            .router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(rejected)?;

        let parameters = TransportParameters {
            id: TransportId::from(transport.id().to_string()),
            ice_parameters: IceParameters(
                serde_json::to_value(transport.ice_parameters()).map_err(rejected)?,
            ),
            ice_candidates: IceCandidates(
                serde_json::to_value(transport.ice_candidates()).map_err(rejected)?,
            ),
            dtls_parameters: DtlsParameters(
                serde_json::to_value(transport.dtls_parameters()).map_err(rejected)?,
            ),
        };

        let (dtls_tx, _) = watch::channel(dtls_state(transport.dtls_state()));
        let dtls_tx = Arc::new(dtls_tx);
        let on_change = {
            let tx = Arc::clone(&dtls_tx);
            transport.on_dtls_state_change(move |state| {
                tx.send_replace(dtls_state(state));
            })
        };
        let on_close = {
            let tx = Arc::clone(&dtls_tx);
            transport.on_close(move || {
                tx.send_replace(DtlsState::Closed);
            })
        };

        Ok(Arc::new(MediasoupTransport {
            transport: Mutex::new(Some(transport)),
            parameters,
            dtls: dtls_tx,
            _handlers: vec![on_change, on_close],
        }))
    }

    fn health(&self) -> watch::Receiver<EngineHealth> {
        self.health.subscribe()
    }
}

struct MediasoupTransport {
    transport: Mutex<Option<ms::WebRtcTransport>>,
    parameters: TransportParameters,
    dtls: Arc<watch::Sender<DtlsState>>,
    _handlers: Vec<ms::HandlerId>,
}

impl MediasoupTransport {
    fn handle(&self) -> std::result::Result<ms::WebRtcTransport, EngineError> {
        self.transport.lock().clone().ok_or(EngineError::Closed)
    }
}

#[async_trait]
impl EngineTransport for MediasoupTransport {
    fn id(&self) -> TransportId {
        self.parameters.id.clone()
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    fn dtls_state(&self) -> watch::Receiver<DtlsState> {
        self.dtls.subscribe()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> std::result::Result<(), EngineError> {
        let transport = self.handle()?;
        let dtls_parameters = convert(&dtls_parameters)?;
        transport
            .connect(ms::WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(rejected)
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> std::result::Result<(), EngineError> {
        let transport = self.handle()?;
        transport
            .set_max_incoming_bitrate(bitrate)
            .await
            .map_err(rejected)
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> std::result::Result<Arc<dyn EngineProducer>, EngineError> {
        let transport = self.handle()?;
        let kind = match kind {
            MediaKind::Audio => ms::MediaKind::Audio,
            MediaKind::Video => ms::MediaKind::Video,
        };
        let rtp_parameters = convert(&rtp_parameters)?;

        let producer = transport
            .produce(ms::ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(rejected)?;

        Ok(Arc::new(MediasoupProducer {
            id: ProducerId::from(producer.id().to_string()),
            kind: media_kind(producer.kind()),
            producer: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> std::result::Result<Arc<dyn EngineConsumer>, EngineError> {
        let transport = self.handle()?;
        let mut options = ms::ConsumerOptions::new(convert(producer_id)?, convert(rtp_capabilities)?);
        options.paused = paused;

        let consumer = transport.consume(options).await.map_err(rejected)?;

        Ok(Arc::new(MediasoupConsumer {
            id: ConsumerId::from(consumer.id().to_string()),
            producer_id: producer_id.clone(),
            kind: media_kind(consumer.kind()),
            rtp_parameters: RtpParameters(
                serde_json::to_value(consumer.rtp_parameters()).map_err(rejected)?,
            ),
            consumer_type: convert(&consumer.r#type())?,
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    fn close(&self) {
        // Dropping the last handle closes the transport on the worker
        drop(self.transport.lock().take());
    }
}

struct MediasoupProducer {
    id: ProducerId,
    kind: MediaKind,
    producer: Mutex<Option<ms::Producer>>,
}

impl EngineProducer for MediasoupProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.producer.lock().as_ref().map_or(false, |p| p.paused())
    }

    fn close(&self) {
        drop(self.producer.lock().take());
    }
}

struct MediasoupConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: ConsumerType,
    consumer: Mutex<Option<ms::Consumer>>,
}

impl MediasoupConsumer {
    fn handle(&self) -> std::result::Result<ms::Consumer, EngineError> {
        self.consumer.lock().clone().ok_or(EngineError::Closed)
    }
}

#[async_trait]
impl EngineConsumer for MediasoupConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    fn paused(&self) -> bool {
        self.consumer.lock().as_ref().map_or(true, |c| c.paused())
    }

    fn producer_paused(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .map_or(false, |c| c.producer_paused())
    }

    async fn resume(&self) -> std::result::Result<(), EngineError> {
        self.handle()?.resume().await.map_err(rejected)
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> std::result::Result<(), EngineError> {
        let preferred = ms::ConsumerLayers {
            spatial_layer: layers.spatial_layer,
            temporal_layer: Some(layers.temporal_layer),
        };
        self.handle()?
            .set_preferred_layers(preferred)
            .await
            .map_err(rejected)
    }

    fn close(&self) {
        drop(self.consumer.lock().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::{WORKER_LOG_LEVELS, WORKER_LOG_TAGS};

    #[test]
    fn test_every_accepted_log_name_maps() {
        for level in WORKER_LOG_LEVELS {
            assert!(log_level(level).is_ok(), "level {}", level);
        }
        for tag in WORKER_LOG_TAGS {
            assert!(log_tag(tag).is_ok(), "tag {}", tag);
        }
        assert!(matches!(log_level("verbose"), Err(Error::Config(_))));
        assert!(matches!(log_tag("webrtc"), Err(Error::Config(_))));
    }
}
