//! rtc-signal: WebRTC publish/subscribe signaling coordinator
//!
//! One browser publishes a track (webcam or screen, plus optional audio) and
//! any number of peers subscribe to it. Packet routing is delegated to an
//! SFU-style [media engine](engine::MediaEngine); this crate sequences the
//! signaling around it: capability exchange, transport creation, DTLS
//! connect, produce, consume and resume.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rtc_signal::engine::InMemoryEngine;
//! use rtc_signal::{ServerConfig, SignalingServer};
//!
//! # async fn run() -> rtc_signal::Result<()> {
//! let server = SignalingServer::new(ServerConfig::default(), Arc::new(InMemoryEngine::new()))?;
//! server.run().await
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, ErrorKind, Result};
pub use room::Room;
pub use server::{MediaConfig, ServerConfig, SignalingServer};
