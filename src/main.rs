//! rtc-signal server binary
//!
//! Run with: cargo run -- --bind 0.0.0.0:3000 --announced-ip 203.0.113.7
//!
//! Clients connect to `ws://<bind>/server`. The default build runs the
//! signaling-only in-memory engine; build with `--features mediasoup` to
//! route real media.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rtc_signal::engine::{ListenIp, MediaEngine};
use rtc_signal::{MediaConfig, ServerConfig, SignalingServer};

/// WebRTC publish/subscribe signaling server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the WebSocket server binds to
    #[arg(long, default_value = "0.0.0.0:3000", env = "RTC_SIGNAL_BIND")]
    bind: SocketAddr,

    /// WebSocket upgrade path
    #[arg(long, default_value = "/server", env = "RTC_SIGNAL_PATH")]
    path: String,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long, default_value_t = 0, env = "RTC_SIGNAL_MAX_CONNECTIONS")]
    max_connections: usize,

    /// Local address media transports listen on
    #[arg(long, default_value = "127.0.0.1", env = "RTC_SIGNAL_LISTEN_IP")]
    listen_ip: IpAddr,

    /// Public address announced in ICE candidates
    #[arg(long, env = "RTC_SIGNAL_ANNOUNCED_IP")]
    announced_ip: Option<String>,

    /// Lowest RTC port
    #[arg(long, default_value_t = 10000, env = "RTC_SIGNAL_MIN_PORT")]
    rtc_min_port: u16,

    /// Highest RTC port
    #[arg(long, default_value_t = 10100, env = "RTC_SIGNAL_MAX_PORT")]
    rtc_max_port: u16,

    /// Incoming bitrate cap per transport in bps (0 disables)
    #[arg(long, default_value_t = 1_500_000, env = "RTC_SIGNAL_MAX_INCOMING_BITRATE")]
    max_incoming_bitrate: u32,

    /// Upper bound on a single media engine call, in milliseconds
    #[arg(long, default_value_t = 10_000, env = "RTC_SIGNAL_ENGINE_TIMEOUT_MS")]
    engine_timeout_ms: u64,

    /// Stats logging interval in seconds
    #[arg(long, default_value_t = 30, env = "RTC_SIGNAL_STATS_INTERVAL")]
    stats_interval: u64,

    /// Media worker log level (debug, warn, error, none)
    #[arg(long, default_value = "warn", env = "RTC_SIGNAL_WORKER_LOG_LEVEL")]
    worker_log_level: String,

    /// Media worker log tags, comma separated
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "info,ice,dtls,rtp,srtp,rtcp",
        env = "RTC_SIGNAL_WORKER_LOG_TAGS"
    )]
    worker_log_tags: Vec<String>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut listen_ip = ListenIp::new(self.listen_ip);
        if let Some(announced) = self.announced_ip {
            listen_ip = listen_ip.announced(announced);
        }

        let media = MediaConfig::default()
            .listen_ips(vec![listen_ip])
            .rtc_ports(self.rtc_min_port..=self.rtc_max_port)
            .max_incoming_bitrate(Some(self.max_incoming_bitrate).filter(|b| *b > 0))
            .engine_timeout(Duration::from_millis(self.engine_timeout_ms))
            .worker_log(self.worker_log_level, self.worker_log_tags);

        ServerConfig::with_addr(self.bind)
            .path(self.path)
            .max_connections(self.max_connections)
            .stats_interval(Duration::from_secs(self.stats_interval))
            .media(media)
    }
}

#[cfg(feature = "mediasoup")]
async fn start_engine(config: &MediaConfig) -> rtc_signal::Result<Arc<dyn MediaEngine>> {
    let engine = rtc_signal::engine::mediasoup::MediasoupEngine::start(config).await?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "mediasoup"))]
async fn start_engine(_config: &MediaConfig) -> rtc_signal::Result<Arc<dyn MediaEngine>> {
    tracing::warn!("Built without mediasoup, running the signaling-only engine");
    Ok(Arc::new(rtc_signal::engine::InMemoryEngine::new()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rtc_signal=info")),
        )
        .init();

    let config = args.into_config();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    let engine = match start_engine(&config.media).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Media engine failed to start");
            return ExitCode::FAILURE;
        }
    };

    let server = match SignalingServer::new(config, engine) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create server");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    match server.run_until(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Server stopped");
            ExitCode::FAILURE
        }
    }
}
