//! Room registries
//!
//! The room is split into registries that each own one concern. Sessions own
//! their transports and consumers; the production manager owns the room's
//! current producers and fans out room events to every session.
//!
//! # Architecture
//!
//! ```text
//!                         Arc<Room>
//!              ┌──────────────────────────────┐
//!              │ capabilities                 │
//!              │ transports  (create/connect) │
//!              │ production  ─── Mutex<kind → producer>
//!              │      │      └── broadcast::Tx<RoomEvent>
//!              │ consumption (can_consume)    │
//!              └──────┼───────────────────────┘
//!                     │
//!        ┌────────────┼─────────────┐
//!        ▼            ▼             ▼
//!   [Publisher]   [Subscriber]  [Subscriber]
//!    produce()    events.recv() events.recv()
//!                     │             │
//!                     └── newProducer ──► WebSocket
//! ```

pub mod capabilities;
pub mod consumption;
pub mod event;
pub mod production;
pub mod transport;

use std::future::Future;
use std::time::Duration;

pub use capabilities::CapabilityRegistry;
pub use consumption::{ConsumerEntry, ConsumptionManager};
pub use event::{RoomEvent, RoomEventKind};
pub use production::{ProducerRef, ProductionManager};
pub use transport::{
    NegotiationGuard, TransportEntry, TransportNotice, TransportRegistry, TransportState,
};

use crate::engine::EngineError;

/// Run an engine call, failing with [`EngineError::Timeout`] after `after`
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    after: Duration,
    call: F,
) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation = operation,
                timeout_ms = after.as_millis() as u64,
                "Engine call timed out"
            );
            Err(EngineError::Timeout { operation, after })
        }
    }
}
