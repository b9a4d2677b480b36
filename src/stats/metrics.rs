//! Statistics for the signaling room

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Live counters shared by the room's registries
#[derive(Debug)]
pub struct RoomStats {
    started_at: Instant,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    transports_created: AtomicU64,
    transports_closed: AtomicU64,
    producers_created: AtomicU64,
    producers_closed: AtomicU64,
    consumers_created: AtomicU64,
    consumers_closed: AtomicU64,
    requests: AtomicU64,
    request_errors: AtomicU64,
    events_dropped: AtomicU64,
}

macro_rules! counter {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl RoomStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            transports_created: AtomicU64::new(0),
            transports_closed: AtomicU64::new(0),
            producers_created: AtomicU64::new(0),
            producers_closed: AtomicU64::new(0),
            consumers_created: AtomicU64::new(0),
            consumers_closed: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            request_errors: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    counter! {
        session_opened => sessions_opened,
        session_closed => sessions_closed,
        transport_created => transports_created,
        transport_closed => transports_closed,
        producer_created => producers_created,
        producer_closed => producers_closed,
        consumer_created => consumers_created,
        consumer_closed => consumers_closed,
        request => requests,
        request_failed => request_errors,
    }

    /// Count events a lagging session never saw
    pub fn events_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime: self.started_at.elapsed(),
            sessions_opened: load(&self.sessions_opened),
            sessions_closed: load(&self.sessions_closed),
            transports_created: load(&self.transports_created),
            transports_closed: load(&self.transports_closed),
            producers_created: load(&self.producers_created),
            producers_closed: load(&self.producers_closed),
            consumers_created: load(&self.consumers_created),
            consumers_closed: load(&self.consumers_closed),
            requests: load(&self.requests),
            request_errors: load(&self.request_errors),
            events_dropped: load(&self.events_dropped),
        }
    }
}

impl RoomStats {
    /// Spawn a background task logging a snapshot every `interval`
    pub fn spawn_report_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let stats = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = stats.snapshot();
                tracing::info!(
                    uptime_s = snapshot.uptime.as_secs(),
                    sessions = snapshot.active_sessions(),
                    transports = snapshot.live_transports(),
                    producers = snapshot.live_producers(),
                    consumers = snapshot.live_consumers(),
                    requests = snapshot.requests,
                    request_errors = snapshot.request_errors,
                    events_dropped = snapshot.events_dropped,
                    "Room stats"
                );
            }
        })
    }
}

impl Default for RoomStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of the room counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub transports_created: u64,
    pub transports_closed: u64,
    pub producers_created: u64,
    pub producers_closed: u64,
    pub consumers_created: u64,
    pub consumers_closed: u64,
    pub requests: u64,
    pub request_errors: u64,
    pub events_dropped: u64,
}

impl StatsSnapshot {
    pub fn active_sessions(&self) -> u64 {
        self.sessions_opened.saturating_sub(self.sessions_closed)
    }

    pub fn live_transports(&self) -> u64 {
        self.transports_created.saturating_sub(self.transports_closed)
    }

    pub fn live_producers(&self) -> u64 {
        self.producers_created.saturating_sub(self.producers_closed)
    }

    pub fn live_consumers(&self) -> u64 {
        self.consumers_created.saturating_sub(self.consumers_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let snapshot = RoomStats::new().snapshot();
        assert_eq!(snapshot.sessions_opened, 0);
        assert_eq!(snapshot.active_sessions(), 0);
        assert_eq!(snapshot.live_transports(), 0);
    }

    #[test]
    fn test_live_counts() {
        let stats = RoomStats::new();
        stats.session_opened();
        stats.session_opened();
        stats.session_closed();
        stats.transport_created();
        stats.producer_created();
        stats.producer_closed();
        stats.consumer_created();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_sessions(), 1);
        assert_eq!(snapshot.live_transports(), 1);
        assert_eq!(snapshot.live_producers(), 0);
        assert_eq!(snapshot.live_consumers(), 1);
    }

    #[test]
    fn test_request_counters() {
        let stats = RoomStats::new();
        stats.request();
        stats.request();
        stats.request_failed();
        stats.events_dropped(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.request_errors, 1);
        assert_eq!(snapshot.events_dropped, 3);
    }
}
