//! In-process media engine
//!
//! A signaling-only engine: it allocates identifiers and tracks object
//! lifecycles exactly like a real SFU would, but forwards no media. It backs
//! protocol development without a native SFU worker and is the engine the
//! test suite runs against, so it keeps a [`Ledger`] of every create and
//! close call and lets callers inject failures and drive DTLS states.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

use super::error::EngineError;
use super::types::*;
use super::{EngineConsumer, EngineHealth, EngineProducer, EngineTransport, MediaEngine};

/// Engine operation that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateTransport,
    Connect,
    Produce,
    Consume,
    Resume,
    PreferredLayers,
}

/// Record of every engine call made by the coordinator
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub transports_created: usize,
    pub transports_closed: usize,
    pub producers_created: usize,
    pub producers_closed: usize,
    pub consumers_created: usize,
    pub consumers_closed: usize,
    pub connect_calls: usize,
    pub produce_calls: usize,
    pub consume_calls: usize,
    pub resume_calls: usize,
    pub bitrate_cap_calls: usize,
    /// Preferred layers set per consumer, in call order
    pub preferred_layers: Vec<(ConsumerId, ConsumerLayers)>,
    /// Identifiers closed more than once
    pub double_closes: Vec<String>,
}

impl Ledger {
    /// Every created object has been closed exactly once
    pub fn is_balanced(&self) -> bool {
        self.double_closes.is_empty()
            && self.transports_created == self.transports_closed
            && self.producers_created == self.producers_closed
            && self.consumers_created == self.consumers_closed
    }
}

#[derive(Debug)]
struct EngineState {
    producers: HashMap<ProducerId, (MediaKind, RtpParameters)>,
    transports: HashMap<TransportId, Arc<watch::Sender<DtlsState>>>,
    incompatible: HashSet<ProducerId>,
    fail_once: HashSet<FailPoint>,
    reject_bitrate_cap: bool,
    auto_connect: bool,
    consumer_type: ConsumerType,
    latency: Duration,
    ledger: Ledger,
}

struct Shared {
    capabilities: RtpCapabilities,
    state: Mutex<EngineState>,
    health: watch::Sender<EngineHealth>,
}

impl Shared {
    fn take_failure(&self, point: FailPoint) -> Result<(), EngineError> {
        if self.state.lock().fail_once.remove(&point) {
            return Err(EngineError::rejected(format!("injected {:?} failure", point)));
        }
        Ok(())
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn ensure_alive(&self) -> Result<(), EngineError> {
        match *self.health.borrow() {
            EngineHealth::Running => Ok(()),
            EngineHealth::Died(_) => Err(EngineError::WorkerDied),
        }
    }

    fn record_close(&self, id: &str, already_closed: bool, bump: impl FnOnce(&mut Ledger)) {
        let mut state = self.state.lock();
        if already_closed {
            state.ledger.double_closes.push(id.to_string());
        } else {
            bump(&mut state.ledger);
        }
    }
}

/// Signaling-only media engine
#[derive(Clone)]
pub struct InMemoryEngine {
    shared: Arc<Shared>,
}

impl InMemoryEngine {
    /// Create an engine advertising Opus and VP8
    pub fn new() -> Self {
        Self::with_capabilities(RtpCapabilities(default_capabilities()))
    }

    pub fn with_capabilities(capabilities: RtpCapabilities) -> Self {
        let (health, _) = watch::channel(EngineHealth::Running);
        Self {
            shared: Arc::new(Shared {
                capabilities,
                state: Mutex::new(EngineState {
                    producers: HashMap::new(),
                    transports: HashMap::new(),
                    incompatible: HashSet::new(),
                    fail_once: HashSet::new(),
                    reject_bitrate_cap: false,
                    auto_connect: true,
                    consumer_type: ConsumerType::Simple,
                    latency: Duration::ZERO,
                    ledger: Ledger::default(),
                }),
                health,
            }),
        }
    }

    /// Snapshot of the call ledger
    pub fn ledger(&self) -> Ledger {
        self.shared.state.lock().ledger.clone()
    }

    /// Make the next call of `point` fail
    pub fn fail_next(&self, point: FailPoint) {
        self.shared.state.lock().fail_once.insert(point);
    }

    /// Reject every incoming bitrate cap
    pub fn reject_bitrate_cap(&self, reject: bool) {
        self.shared.state.lock().reject_bitrate_cap = reject;
    }

    /// Report `producer_id` as unconsumable for any capabilities
    pub fn mark_incompatible(&self, producer_id: &ProducerId) {
        self.shared.state.lock().incompatible.insert(producer_id.clone());
    }

    /// Type reported by consumers created from now on
    pub fn set_consumer_type(&self, consumer_type: ConsumerType) {
        self.shared.state.lock().consumer_type = consumer_type;
    }

    /// When disabled, `connect` leaves the transport in `Connecting` until
    /// [`set_dtls_state`](Self::set_dtls_state) moves it on
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.shared.state.lock().auto_connect = auto_connect;
    }

    /// Delay every async engine call
    pub fn set_latency(&self, latency: Duration) {
        self.shared.state.lock().latency = latency;
    }

    /// Drive the DTLS state of a transport as the engine would
    pub fn set_dtls_state(&self, transport_id: &TransportId, state: DtlsState) -> bool {
        let sender = self.shared.state.lock().transports.get(transport_id).cloned();
        match sender {
            Some(tx) => {
                tx.send_replace(state);
                true
            }
            None => false,
        }
    }

    /// Simulate a worker crash
    pub fn kill_worker(&self, reason: impl Into<String>) {
        self.shared.health.send_replace(EngineHealth::Died(reason.into()));
    }

    /// Producers currently alive on the engine
    pub fn live_producers(&self) -> usize {
        self.shared.state.lock().producers.len()
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn default_capabilities() -> serde_json::Value {
    json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "parameters": { "useinbandfec": 1 },
                "rtcpFeedback": [{ "type": "transport-cc", "parameter": "" }]
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000,
                "parameters": {},
                "rtcpFeedback": [
                    { "type": "nack", "parameter": "" },
                    { "type": "nack", "parameter": "pli" },
                    { "type": "ccm", "parameter": "fir" },
                    { "type": "goog-remb", "parameter": "" },
                    { "type": "transport-cc", "parameter": "" }
                ]
            }
        ],
        "headerExtensions": []
    })
}

#[async_trait]
impl MediaEngine for InMemoryEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.shared.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let state = self.shared.state.lock();
        !rtp_capabilities.as_value().is_null()
            && state.producers.contains_key(producer_id)
            && !state.incompatible.contains(producer_id)
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        self.shared.ensure_alive()?;
        self.shared.delay().await;
        self.shared.take_failure(FailPoint::CreateTransport)?;

        if options.listen_ips.is_empty() || !(options.enable_udp || options.enable_tcp) {
            return Err(EngineError::rejected("no listen address or protocol enabled"));
        }

        let id = TransportId::random();
        let candidates: Vec<_> = options
            .listen_ips
            .iter()
            .flat_map(|listen| {
                let address = listen
                    .announced_ip
                    .clone()
                    .unwrap_or_else(|| listen.ip.to_string());
                let mut protocols = Vec::new();
                if options.enable_udp {
                    protocols.push("udp");
                }
                if options.enable_tcp {
                    protocols.push("tcp");
                }
                let prefer_udp = options.prefer_udp;
                protocols.into_iter().map(move |protocol| {
                    let priority: u32 = if protocol == "udp" && prefer_udp {
                        1_076_302_079
                    } else {
                        1_076_276_479
                    };
                    json!({
                        "foundation": format!("{}{}", protocol, address),
                        "priority": priority,
                        "address": address,
                        "protocol": protocol,
                        "port": 40000,
                        "type": "host",
                    })
                })
            })
            .collect();

        let parameters = TransportParameters {
            id: id.clone(),
            ice_parameters: IceParameters(json!({
                "usernameFragment": uuid::Uuid::new_v4().simple().to_string(),
                "password": uuid::Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            })),
            ice_candidates: IceCandidates(json!(candidates)),
            dtls_parameters: DtlsParameters(json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": "00:00" }],
            })),
        };

        let (dtls, _) = watch::channel(DtlsState::New);
        let dtls = Arc::new(dtls);
        {
            let mut state = self.shared.state.lock();
            state.transports.insert(id.clone(), Arc::clone(&dtls));
            state.ledger.transports_created += 1;
        }

        Ok(Arc::new(MemoryTransport {
            shared: Arc::clone(&self.shared),
            parameters,
            dtls,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn health(&self) -> watch::Receiver<EngineHealth> {
        self.shared.health.subscribe()
    }
}

struct MemoryTransport {
    shared: Arc<Shared>,
    parameters: TransportParameters,
    dtls: Arc<watch::Sender<DtlsState>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        self.shared.ensure_alive()
    }
}

#[async_trait]
impl EngineTransport for MemoryTransport {
    fn id(&self) -> TransportId {
        self.parameters.id.clone()
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    fn dtls_state(&self) -> watch::Receiver<DtlsState> {
        self.dtls.subscribe()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.shared.state.lock().ledger.connect_calls += 1;
        self.ensure_open()?;
        self.shared.delay().await;
        self.shared.take_failure(FailPoint::Connect)?;

        if dtls_parameters.as_value().is_null() {
            return Err(EngineError::rejected("missing dtlsParameters"));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(EngineError::rejected("connect() already called"));
        }

        let auto_connect = self.shared.state.lock().auto_connect;
        self.dtls.send_replace(DtlsState::Connecting);
        if auto_connect {
            self.dtls.send_replace(DtlsState::Connected);
        }
        Ok(())
    }

    async fn set_max_incoming_bitrate(&self, _bitrate: u32) -> Result<(), EngineError> {
        let reject = {
            let mut state = self.shared.state.lock();
            state.ledger.bitrate_cap_calls += 1;
            state.reject_bitrate_cap
        };
        if reject {
            return Err(EngineError::rejected("bitrate cap not supported"));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        self.shared.state.lock().ledger.produce_calls += 1;
        self.ensure_open()?;
        self.shared.delay().await;
        self.shared.take_failure(FailPoint::Produce)?;

        let id = ProducerId::random();
        {
            let mut state = self.shared.state.lock();
            state.producers.insert(id.clone(), (kind, rtp_parameters));
            state.ledger.producers_created += 1;
        }

        Ok(Arc::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
            id,
            kind,
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        self.shared.state.lock().ledger.consume_calls += 1;
        self.ensure_open()?;
        self.shared.delay().await;
        self.shared.take_failure(FailPoint::Consume)?;

        if rtp_capabilities.as_value().is_null() {
            return Err(EngineError::rejected("missing rtpCapabilities"));
        }

        let (kind, rtp_parameters, consumer_type) = {
            let mut state = self.shared.state.lock();
            let (kind, rtp_parameters) = state
                .producers
                .get(producer_id)
                .cloned()
                .ok_or_else(|| EngineError::rejected(format!("Producer not found: {}", producer_id)))?;
            state.ledger.consumers_created += 1;
            (kind, rtp_parameters, state.consumer_type)
        };

        Ok(Arc::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            id: ConsumerId::random(),
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            consumer_type,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) {
        let already = self.closed.swap(true, Ordering::AcqRel);
        self.shared
            .record_close(self.parameters.id.as_str(), already, |l| l.transports_closed += 1);
        if !already {
            self.shared.state.lock().transports.remove(&self.parameters.id);
            self.dtls.send_replace(DtlsState::Closed);
        }
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
    id: ProducerId,
    kind: MediaKind,
    closed: AtomicBool,
}

impl EngineProducer for MemoryProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        false
    }

    fn close(&self) {
        let already = self.closed.swap(true, Ordering::AcqRel);
        self.shared
            .record_close(self.id.as_str(), already, |l| l.producers_closed += 1);
        if !already {
            self.shared.state.lock().producers.remove(&self.id);
        }
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: ConsumerType,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl EngineConsumer for MemoryConsumer {
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
        self.paused.load(Ordering::Acquire)
    }

    fn producer_paused(&self) -> bool {
        false
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.shared.state.lock().ledger.resume_calls += 1;
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        self.shared.delay().await;
        self.shared.take_failure(FailPoint::Resume)?;
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), EngineError> {
        self.shared.take_failure(FailPoint::PreferredLayers)?;
        self.shared
            .state
            .lock()
            .ledger
            .preferred_layers
            .push((self.id.clone(), layers));
        Ok(())
    }

    fn close(&self) {
        let already = self.closed.swap(true, Ordering::AcqRel);
        self.shared
            .record_close(self.id.as_str(), already, |l| l.consumers_closed += 1);
    }
}
