//! WebSocket signaling server

pub mod config;
pub mod connection;
pub mod listener;

pub use config::{MediaConfig, ServerConfig};
pub use listener::SignalingServer;
