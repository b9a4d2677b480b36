//! Transport registry
//!
//! Brokers WebRTC transport creation and the DTLS connect handshake against
//! the media engine. Transports are owned by their session: the entry lives in
//! [`SessionState`] under its direction and nowhere else.
//!
//! ```text
//!   create()        connect()           engine DTLS event
//! ──────────► New ───────────► Connecting ─────────────────► Connected
//!              │                   │                            │
//!              └───────────────────┴──────► Failed / Closed ◄───┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::bounded;
use crate::engine::{
    DtlsParameters, DtlsState, EngineTransport, MediaEngine, TransportId, TransportParameters,
};
use crate::error::{Direction, Error, Result};
use crate::server::config::MediaConfig;
use crate::session::SessionState;
use crate::stats::RoomStats;

/// Lifecycle state of a session transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created, waiting for the client's DTLS parameters
    New,
    /// DTLS parameters accepted, handshake in progress
    Connecting,
    /// DTLS handshake completed
    Connected,
    /// ICE or DTLS failed
    Failed,
    /// Closed by the engine
    Closed,
}

impl TransportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

/// Engine-reported DTLS state change, delivered to the owning session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportNotice {
    pub direction: Direction,
    pub transport_id: TransportId,
    pub state: DtlsState,
}

/// A transport owned by a session
pub struct TransportEntry {
    direction: Direction,
    transport: Arc<dyn EngineTransport>,
    dtls: watch::Receiver<DtlsState>,
    connect_requested: bool,
    negotiating: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
    created_at: Instant,
}

impl TransportEntry {
    pub fn id(&self) -> TransportId {
        self.transport.id()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transport(&self) -> &Arc<dyn EngineTransport> {
        &self.transport
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Current state, combining the signaling and engine views
    pub fn state(&self) -> TransportState {
        let dtls = *self.dtls.borrow();
        match dtls {
            DtlsState::Failed => TransportState::Failed,
            DtlsState::Closed => TransportState::Closed,
            _ if !self.connect_requested => TransportState::New,
            DtlsState::Connected => TransportState::Connected,
            DtlsState::New | DtlsState::Connecting => TransportState::Connecting,
        }
    }

    /// Wait for the engine to report the DTLS handshake complete
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let id = self.id();
        let mut dtls = self.dtls.clone();

        let wait = async {
            loop {
                let state = *dtls.borrow_and_update();
                match state {
                    DtlsState::Connected => return Ok(()),
                    DtlsState::Failed | DtlsState::Closed => {
                        return Err(Error::TransportUnusable(id.clone()))
                    }
                    DtlsState::New | DtlsState::Connecting => {}
                }
                if dtls.changed().await.is_err() {
                    return Err(Error::TransportUnusable(id.clone()));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransportNotConnected(self.id())),
        }
    }

    /// Claim the transport for one produce/consume negotiation
    ///
    /// The claim is released when the returned guard drops, including when
    /// the request future is cancelled by a disconnect.
    pub fn begin_negotiation(&self) -> Result<NegotiationGuard> {
        if self.negotiating.swap(true, Ordering::AcqRel) {
            return Err(Error::NegotiationInFlight(self.id()));
        }
        Ok(NegotiationGuard(Arc::clone(&self.negotiating)))
    }
}

impl std::fmt::Debug for TransportEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEntry")
            .field("id", &self.id())
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Exclusive claim on a transport for one negotiation
#[derive(Debug)]
pub struct NegotiationGuard(Arc<AtomicBool>);

impl Drop for NegotiationGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Creates, connects and closes session transports
pub struct TransportRegistry {
    engine: Arc<dyn MediaEngine>,
    config: MediaConfig,
    stats: Arc<RoomStats>,
}

impl TransportRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, config: MediaConfig, stats: Arc<RoomStats>) -> Self {
        Self {
            engine,
            config,
            stats,
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Allocate a transport and record it in the session under `direction`
    ///
    /// The caller must have released any previous transport for the direction.
    pub async fn create(
        &self,
        session: &mut SessionState,
        direction: Direction,
        force_tcp: bool,
    ) -> Result<TransportParameters> {
        let options = self.config.transport_options(force_tcp);
        let transport = bounded(
            "createWebRtcTransport",
            self.config.engine_timeout,
            self.engine.create_webrtc_transport(options),
        )
        .await?;
        self.stats.transport_created();

        let id = transport.id();
        if let Some(bitrate) = self.config.max_incoming_bitrate {
            self.apply_bitrate_cap_best_effort(transport.as_ref(), bitrate)
                .await;
        }

        let watcher = spawn_dtls_watcher(
            direction,
            id.clone(),
            transport.dtls_state(),
            session.notice_sender(),
        );

        let entry = TransportEntry {
            direction,
            dtls: transport.dtls_state(),
            transport,
            connect_requested: false,
            negotiating: Arc::new(AtomicBool::new(false)),
            watcher,
            created_at: Instant::now(),
        };
        let parameters = entry.transport.parameters();
        if let Some(previous) = session.set_transport(entry) {
            // Callers release first; close anyway so nothing leaks
            tracing::warn!(
                session_id = session.id(),
                transport_id = %previous.id(),
                "Replacing transport that was not released"
            );
            self.close(previous);
        }

        tracing::info!(
            session_id = session.id(),
            transport_id = %id,
            direction = %direction,
            force_tcp = force_tcp,
            "Transport created"
        );

        Ok(parameters)
    }

    /// Cap the transport's incoming bitrate, ignoring engine refusal
    ///
    /// Some engine builds reject the cap (e.g. when bandwidth estimation is
    /// disabled); the transport stays fully usable without it.
    pub async fn apply_bitrate_cap_best_effort(&self, transport: &dyn EngineTransport, bitrate: u32) {
        let result = bounded(
            "setMaxIncomingBitrate",
            self.config.engine_timeout,
            transport.set_max_incoming_bitrate(bitrate),
        )
        .await;

        if let Err(e) = result {
            tracing::debug!(
                transport_id = %transport.id(),
                bitrate = bitrate,
                error = %e,
                "Incoming bitrate cap not applied"
            );
        }
    }

    /// Hand the client's DTLS parameters to the engine
    pub async fn connect(
        &self,
        session: &mut SessionState,
        direction: Direction,
        transport_id: Option<&TransportId>,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let session_id = session.id();
        let entry = session
            .transport_mut(direction)
            .ok_or_else(|| match transport_id {
                Some(id) => Error::UnknownTransport {
                    direction,
                    id: id.clone(),
                },
                None => match direction {
                    Direction::Send => Error::NoSendTransport,
                    Direction::Recv => Error::NoReceiveTransport,
                },
            })?;

        if let Some(id) = transport_id {
            if *id != entry.id() {
                return Err(Error::UnknownTransport {
                    direction,
                    id: id.clone(),
                });
            }
        }
        if entry.state().is_terminal() {
            return Err(Error::UnknownTransport {
                direction,
                id: entry.id(),
            });
        }
        if entry.connect_requested {
            tracing::warn!(
                session_id = session_id,
                transport_id = %entry.id(),
                "Duplicate transport connect rejected"
            );
            return Err(Error::AlreadyConnected(entry.id()));
        }

        entry.connect_requested = true;
        let result = bounded(
            "connect",
            self.config.engine_timeout,
            entry.transport.connect(dtls_parameters),
        )
        .await;

        if let Err(e) = result {
            entry.connect_requested = false;
            return Err(e.into());
        }

        tracing::info!(
            session_id = session_id,
            transport_id = %entry.id(),
            direction = %direction,
            "Transport connect accepted"
        );
        Ok(())
    }

    /// Close a transport on the engine
    ///
    /// Producers and consumers on the transport must have been released by
    /// the caller; the engine object itself is closed exactly once here.
    pub fn close(&self, entry: TransportEntry) {
        entry.watcher.abort();
        entry.transport.close();
        self.stats.transport_closed();

        tracing::debug!(
            transport_id = %entry.id(),
            direction = %entry.direction,
            age_ms = entry.age().as_millis() as u64,
            "Transport closed"
        );
    }
}

fn spawn_dtls_watcher(
    direction: Direction,
    transport_id: TransportId,
    mut dtls: watch::Receiver<DtlsState>,
    notices: mpsc::UnboundedSender<TransportNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while dtls.changed().await.is_ok() {
            let state = *dtls.borrow_and_update();
            let notice = TransportNotice {
                direction,
                transport_id: transport_id.clone(),
                state,
            };
            if notices.send(notice).is_err() || state.is_terminal() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::memory::FailPoint;
    use crate::engine::InMemoryEngine;

    fn setup() -> (InMemoryEngine, TransportRegistry, SessionState) {
        let engine = InMemoryEngine::new();
        let registry = TransportRegistry::new(
            Arc::new(engine.clone()),
            MediaConfig::default(),
            Arc::new(RoomStats::new()),
        );
        let (session, _notices) = SessionState::new(1, None);
        (engine, registry, session)
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters(json!({"role": "client", "fingerprints": []}))
    }

    #[tokio::test]
    async fn test_create_records_transport() {
        let (engine, registry, mut session) = setup();

        let params = registry
            .create(&mut session, Direction::Send, false)
            .await
            .unwrap();

        let entry = session.transport(Direction::Send).unwrap();
        assert_eq!(entry.id(), params.id);
        assert_eq!(entry.state(), TransportState::New);
        assert!(session.transport(Direction::Recv).is_none());
        assert_eq!(engine.ledger().transports_created, 1);
        assert_eq!(engine.ledger().bitrate_cap_calls, 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_reported() {
        let (engine, registry, mut session) = setup();
        engine.fail_next(FailPoint::CreateTransport);

        let err = registry
            .create(&mut session, Direction::Recv, false)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Engine(_)));
        assert!(session.transport(Direction::Recv).is_none());
    }

    #[tokio::test]
    async fn test_rejected_bitrate_cap_is_soft() {
        let (engine, registry, mut session) = setup();
        engine.reject_bitrate_cap(true);

        let result = registry.create(&mut session, Direction::Send, false).await;

        tokio_test::assert_ok!(result);
        assert_eq!(engine.ledger().bitrate_cap_calls, 1);
    }

    #[tokio::test]
    async fn test_connect_then_duplicate_connect() {
        let (engine, registry, mut session) = setup();
        let params = registry
            .create(&mut session, Direction::Send, false)
            .await
            .unwrap();

        registry
            .connect(&mut session, Direction::Send, None, dtls())
            .await
            .unwrap();
        assert_eq!(
            session.transport(Direction::Send).unwrap().state(),
            TransportState::Connected
        );

        let err = registry
            .connect(&mut session, Direction::Send, Some(&params.id), dtls())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected(id) if id == params.id));
        assert_eq!(engine.ledger().connect_calls, 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_transport() {
        let (_engine, registry, mut session) = setup();

        let err = registry
            .connect(&mut session, Direction::Recv, None, dtls())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoReceiveTransport));

        registry
            .create(&mut session, Direction::Recv, false)
            .await
            .unwrap();
        let bogus = TransportId::from("bogus");
        let err = registry
            .connect(&mut session, Direction::Recv, Some(&bogus), dtls())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTransport { .. }));
    }

    #[tokio::test]
    async fn test_failed_connect_can_be_retried() {
        let (engine, registry, mut session) = setup();
        registry
            .create(&mut session, Direction::Send, false)
            .await
            .unwrap();
        engine.fail_next(FailPoint::Connect);

        assert!(registry
            .connect(&mut session, Direction::Send, None, dtls())
            .await
            .is_err());
        tokio_test::assert_ok!(
            registry
                .connect(&mut session, Direction::Send, None, dtls())
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_connected_follows_engine() {
        let (engine, registry, mut session) = setup();
        engine.set_auto_connect(false);
        let params = registry
            .create(&mut session, Direction::Send, false)
            .await
            .unwrap();
        registry
            .connect(&mut session, Direction::Send, None, dtls())
            .await
            .unwrap();

        let entry = session.transport(Direction::Send).unwrap();
        assert_eq!(entry.state(), TransportState::Connecting);

        let err = entry
            .wait_connected(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportNotConnected(_)));

        engine.set_dtls_state(&params.id, DtlsState::Connected);
        tokio_test::assert_ok!(entry.wait_connected(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_engine_timeout_maps_to_engine_failure() {
        let engine = InMemoryEngine::new();
        engine.set_latency(Duration::from_millis(200));
        let registry = TransportRegistry::new(
            Arc::new(engine.clone()),
            MediaConfig::default().engine_timeout(Duration::from_millis(20)),
            Arc::new(RoomStats::new()),
        );
        let (mut session, _notices) = SessionState::new(1, None);

        let err = registry
            .create(&mut session, Direction::Send, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Engine(crate::engine::EngineError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_negotiation_guard_is_exclusive() {
        let (_engine, registry, mut session) = setup();
        registry
            .create(&mut session, Direction::Send, false)
            .await
            .unwrap();
        let entry = session.transport(Direction::Send).unwrap();

        let guard = entry.begin_negotiation().unwrap();
        assert!(matches!(
            entry.begin_negotiation(),
            Err(Error::NegotiationInFlight(_))
        ));
        drop(guard);
        assert!(entry.begin_negotiation().is_ok());
    }

    #[tokio::test]
    async fn test_close_notifies_engine_once() {
        let (engine, registry, mut session) = setup();
        registry
            .create(&mut session, Direction::Send, false)
            .await
            .unwrap();

        let entry = session.take_transport(Direction::Send).unwrap();
        registry.close(entry);

        let ledger = engine.ledger();
        assert_eq!(ledger.transports_closed, 1);
        assert!(ledger.double_closes.is_empty());
    }
}
