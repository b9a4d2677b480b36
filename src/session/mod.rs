//! Signaling sessions
//!
//! A session is one client connection. It moves along two independent axes:
//!
//! ```text
//! publish:   Idle → TransportCreated → TransportConnected → Producing
//! subscribe: Idle → TransportCreated → Consuming → Resumed
//! ```

pub mod handler;
pub mod state;
pub mod task;

pub use handler::SessionHandler;
pub use state::{PublishPhase, SessionState, SubscribePhase};
pub use task::run_session;

/// Unique session identifier within the room
pub type SessionId = u64;
