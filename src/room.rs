//! The signaling room
//!
//! One room per process. The room holds the registries and hands each new
//! session its state plus the channels its task listens on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};

use crate::engine::{EngineHealth, MediaEngine};
use crate::error::Result;
use crate::registry::{
    CapabilityRegistry, ConsumptionManager, ProductionManager, RoomEvent, TransportNotice,
    TransportRegistry,
};
use crate::server::config::ServerConfig;
use crate::session::{SessionId, SessionState};
use crate::stats::RoomStats;

/// Identifier tagging a room in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId(uuid::Uuid);

impl RoomId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A freshly opened session and the channels its task must drain
pub struct OpenedSession {
    pub state: SessionState,
    pub events: broadcast::Receiver<RoomEvent>,
    pub notices: mpsc::UnboundedReceiver<TransportNotice>,
}

/// Registries shared by every session
pub struct Room {
    id: RoomId,
    engine: Arc<dyn MediaEngine>,
    pub capabilities: CapabilityRegistry,
    pub transports: TransportRegistry,
    pub production: Arc<ProductionManager>,
    pub consumption: ConsumptionManager,
    stats: Arc<RoomStats>,
    next_session_id: AtomicU64,
}

impl Room {
    /// Build the room on top of an initialized engine
    ///
    /// Fails with a configuration error when the engine's router advertises
    /// no capabilities.
    pub fn new(engine: Arc<dyn MediaEngine>, config: &ServerConfig) -> Result<Self> {
        let capabilities = CapabilityRegistry::load(engine.as_ref())?;
        let stats = Arc::new(RoomStats::new());
        let media = config.media.clone();

        let transports =
            TransportRegistry::new(Arc::clone(&engine), media.clone(), Arc::clone(&stats));
        let production = Arc::new(ProductionManager::new(
            config.event_capacity,
            media.engine_timeout,
            Arc::clone(&stats),
        ));
        let consumption = ConsumptionManager::new(
            Arc::clone(&engine),
            Arc::clone(&production),
            media,
            Arc::clone(&stats),
        );

        let id = RoomId::new();
        tracing::info!(room_id = %id, "Room created");

        Ok(Self {
            id,
            engine,
            capabilities,
            transports,
            production,
            consumption,
            stats,
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn stats(&self) -> &Arc<RoomStats> {
        &self.stats
    }

    /// Watch the media engine's worker
    pub fn engine_health(&self) -> watch::Receiver<EngineHealth> {
        self.engine.health()
    }

    /// Register a new session
    ///
    /// The event receiver is subscribed before the session can learn about
    /// current producers, so no announcement falls in between.
    pub fn open_session(&self, peer_addr: Option<SocketAddr>) -> OpenedSession {
        let id: SessionId = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let events = self.production.subscribe();
        let (state, notices) = SessionState::new(id, peer_addr);
        self.stats.session_opened();

        tracing::info!(
            room_id = %self.id,
            session_id = id,
            peer = ?peer_addr,
            "Session opened"
        );

        OpenedSession {
            state,
            events,
            notices,
        }
    }
}
