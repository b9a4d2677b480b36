//! Signaling server listener
//!
//! Handles the TCP accept loop and spawns one connection task per client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use crate::engine::{EngineError, EngineHealth, MediaEngine};
use crate::error::{Error, Result};
use crate::room::Room;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;

/// WebSocket signaling server for one room
pub struct SignalingServer {
    config: ServerConfig,
    room: Arc<Room>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl SignalingServer {
    /// Create a server on top of an initialized media engine
    ///
    /// Fails with a configuration error if `config` is invalid or the
    /// engine's router cannot serve a room.
    pub fn new(config: ServerConfig, engine: Arc<dyn MediaEngine>) -> Result<Self> {
        config.validate()?;
        let room = Arc::new(Room::new(engine, &config)?);

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Ok(Self {
            config,
            room,
            connection_semaphore,
        })
    }

    /// Get a reference to the room
    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Run the server
    ///
    /// Returns only if the media engine worker dies.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tracing::info!(
            addr = %listener.local_addr()?,
            path = %self.config.path,
            room_id = %self.room.id(),
            "Signaling server listening"
        );

        let stats_handle = self
            .room
            .stats()
            .spawn_report_task(self.config.stats_interval);

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            reason = wait_for_worker_death(self.room.engine_health()) => {
                tracing::error!(
                    reason = %reason,
                    exit_delay_ms = self.config.worker_death_exit_delay.as_millis() as u64,
                    "Media engine worker died"
                );
                tokio::time::sleep(self.config.worker_death_exit_delay).await;
                Err(Error::Engine(EngineError::WorkerDied))
            }
            result = self.accept_loop(&listener) => result,
        };

        stats_handle.abort();

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        if let Err(e) = socket.set_nodelay(true) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        tracing::debug!(peer = %peer_addr, "New connection");

        let config = self.config.clone();
        let room = Arc::clone(&self.room);

        tokio::spawn(async move {
            // Held for the lifetime of the connection
            let _permit = permit;
            let connection = Connection::new(socket, peer_addr, config, room);

            match connection.run().await {
                Ok(session_id) => {
                    tracing::debug!(session_id = session_id, "Connection closed");
                }
                Err(e) => {
                    tracing::debug!(peer = %peer_addr, error = %e, "Connection error");
                }
            }
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}

/// Resolve once the engine reports its worker dead
async fn wait_for_worker_death(mut health: watch::Receiver<EngineHealth>) -> String {
    loop {
        let current = health.borrow_and_update().clone();
        if let EngineHealth::Died(reason) = current {
            return reason;
        }
        if health.changed().await.is_err() {
            // Engine dropped its health sender; nothing left to watch
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::InMemoryEngine;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ServerConfig::default().path("server");
        let result = SignalingServer::new(config, Arc::new(InMemoryEngine::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_zero_stats_interval_is_rejected_before_serving() {
        let config = ServerConfig::default().stats_interval(Duration::ZERO);
        let result = SignalingServer::new(config, Arc::new(InMemoryEngine::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let server =
            SignalingServer::new(ServerConfig::default(), Arc::new(InMemoryEngine::new())).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let result = server.serve(listener, async {}).await;
        tokio_test::assert_ok!(result);
    }

    #[tokio::test]
    async fn test_worker_death_ends_server() {
        let engine = InMemoryEngine::new();
        let mut config = ServerConfig::default();
        config.worker_death_exit_delay = Duration::from_millis(10);
        let server = SignalingServer::new(config, Arc::new(engine.clone())).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let killer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.kill_worker("worker exited with code 42");
        });

        let result = server.serve(listener, std::future::pending()).await;
        killer.await.unwrap();
        match result {
            Err(e) => assert!(e.is_fatal()),
            Ok(()) => panic!("server survived a dead worker"),
        }
    }
}
