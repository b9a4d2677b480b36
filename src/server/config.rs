//! Server configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::engine::{ConsumerLayers, ListenIp, WebRtcTransportOptions};
use crate::error::{Error, Result};

/// Default signaling port
pub const DEFAULT_PORT: u16 = 3000;

/// Default WebSocket upgrade path
pub const DEFAULT_PATH: &str = "/server";

/// Log levels the media worker accepts
pub const WORKER_LOG_LEVELS: &[&str] = &["debug", "warn", "error", "none"];

/// Log tags the media worker accepts
pub const WORKER_LOG_TAGS: &[&str] = &[
    "info", "ice", "dtls", "rtp", "srtp", "rtcp", "rtx", "bwe", "score", "simulcast", "svc",
    "sctp", "message",
];

/// Signaling server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// WebSocket upgrade path; other paths are refused
    pub path: String,

    /// Maximum concurrent sessions (0 = unlimited)
    pub max_connections: usize,

    /// Capacity of the room event channel
    pub event_capacity: usize,

    /// Capacity of each session's outbound frame queue
    pub outbound_capacity: usize,

    /// Stats logging interval
    pub stats_interval: Duration,

    /// Delay before exiting once the engine worker died
    pub worker_death_exit_delay: Duration,

    /// Media engine options
    pub media: MediaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            path: DEFAULT_PATH.to_string(),
            max_connections: 0, // Unlimited
            event_capacity: 64,
            outbound_capacity: 128,
            stats_interval: Duration::from_secs(30),
            worker_death_exit_delay: Duration::from_secs(2),
            media: MediaConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the WebSocket path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set stats interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set the media engine options
    pub fn media(mut self, media: MediaConfig) -> Self {
        self.media = media;
        self
    }

    /// Check the configuration can serve
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::Config(format!(
                "WebSocket path must start with '/': {}",
                self.path
            )));
        }
        if self.event_capacity == 0 || self.outbound_capacity == 0 {
            return Err(Error::Config("channel capacities must be non-zero".into()));
        }
        if self.stats_interval.is_zero() {
            return Err(Error::Config("stats interval must be non-zero".into()));
        }
        self.media.validate()
    }
}

/// Media engine options applied to every transport, producer and consumer
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Addresses transports listen on
    pub listen_ips: Vec<ListenIp>,

    /// RTC port range handed to the engine worker
    pub rtc_ports: RangeInclusive<u16>,

    /// Offer UDP candidates
    pub enable_udp: bool,

    /// Offer TCP candidates
    pub enable_tcp: bool,

    /// Rank UDP candidates above TCP
    pub prefer_udp: bool,

    /// Initial outgoing bitrate estimate (bps)
    pub initial_available_outgoing_bitrate: u32,

    /// Best-effort cap on incoming bitrate per transport (bps)
    pub max_incoming_bitrate: Option<u32>,

    /// Upper bound on any single engine call
    pub engine_timeout: Duration,

    /// Layers requested for simulcast consumers
    pub preferred_layers: ConsumerLayers,

    /// Media worker log level
    pub worker_log_level: String,

    /// Media worker log tags
    pub worker_log_tags: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp::new(IpAddr::V4(Ipv4Addr::LOCALHOST))],
            rtc_ports: 10000..=10100,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: Some(1_500_000),
            engine_timeout: Duration::from_secs(10),
            preferred_layers: ConsumerLayers::default(),
            worker_log_level: "warn".to_string(),
            worker_log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
                .iter()
                .map(|tag| tag.to_string())
                .collect(),
        }
    }
}

impl MediaConfig {
    /// Replace the listen addresses
    pub fn listen_ips(mut self, listen_ips: Vec<ListenIp>) -> Self {
        self.listen_ips = listen_ips;
        self
    }

    /// Set the RTC port range
    pub fn rtc_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.rtc_ports = ports;
        self
    }

    /// Set the incoming bitrate cap (`None` disables it)
    pub fn max_incoming_bitrate(mut self, bitrate: Option<u32>) -> Self {
        self.max_incoming_bitrate = bitrate;
        self
    }

    /// Set the engine call timeout
    pub fn engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout = timeout;
        self
    }

    /// Set the preferred simulcast layers
    pub fn preferred_layers(mut self, layers: ConsumerLayers) -> Self {
        self.preferred_layers = layers;
        self
    }

    /// Set the media worker log level and tags
    pub fn worker_log(mut self, level: impl Into<String>, tags: Vec<String>) -> Self {
        self.worker_log_level = level.into();
        self.worker_log_tags = tags;
        self
    }

    /// Transport options for one `createWebRtcTransport` call
    ///
    /// `force_tcp` drops UDP candidates for clients behind UDP-hostile networks.
    pub fn transport_options(&self, force_tcp: bool) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: self.listen_ips.clone(),
            enable_udp: self.enable_udp && !force_tcp,
            enable_tcp: self.enable_tcp || force_tcp,
            prefer_udp: self.prefer_udp && !force_tcp,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_ips.is_empty() {
            return Err(Error::Config("at least one listen IP is required".into()));
        }
        if !self.enable_udp && !self.enable_tcp {
            return Err(Error::Config("UDP and TCP are both disabled".into()));
        }
        if self.rtc_ports.is_empty() {
            return Err(Error::Config(format!(
                "empty RTC port range {}-{}",
                self.rtc_ports.start(),
                self.rtc_ports.end()
            )));
        }
        if self.engine_timeout.is_zero() {
            return Err(Error::Config("engine timeout must be non-zero".into()));
        }
        if !WORKER_LOG_LEVELS.contains(&self.worker_log_level.as_str()) {
            return Err(Error::Config(format!(
                "unknown worker log level: {}",
                self.worker_log_level
            )));
        }
        if let Some(tag) = self
            .worker_log_tags
            .iter()
            .find(|tag| !WORKER_LOG_TAGS.contains(&tag.as_str()))
        {
            return Err(Error::Config(format!("unknown worker log tag: {}", tag)));
        }
        Ok(())
    }
}
