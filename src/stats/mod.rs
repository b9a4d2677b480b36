//! Room statistics

pub mod metrics;

pub use metrics::{RoomStats, StatsSnapshot};
