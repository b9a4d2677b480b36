//! WebSocket connection
//!
//! Upgrades one TCP stream, then splits it: a forward task drains the
//! session's outbound queue into the socket while the session task consumes
//! inbound text frames.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::error::Result;
use crate::protocol::ServerMessage;
use crate::room::Room;
use crate::server::config::ServerConfig;
use crate::session::{run_session, SessionId};

/// One signaling connection
pub struct Connection {
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: ServerConfig,
    room: Arc<Room>,
}

impl Connection {
    pub fn new(socket: TcpStream, peer_addr: SocketAddr, config: ServerConfig, room: Arc<Room>) -> Self {
        Self {
            socket,
            peer_addr,
            config,
            room,
        }
    }

    /// Serve the connection until either side closes it
    pub async fn run(self) -> Result<SessionId> {
        let path = self.config.path.clone();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == path {
                Ok(response)
            } else {
                let mut refusal = ErrorResponse::new(Some("unknown signaling path".to_string()));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(self.socket, check_path).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let opened = self.room.open_session(Some(self.peer_addr));
        let session_id = opened.state.id();

        let (outbound, mut outbound_rx) = mpsc::channel::<ServerMessage>(self.config.outbound_capacity);
        let forward_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(session_id = session_id, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    tracing::debug!(session_id = session_id, error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Text frames only; pings are answered by tungstenite, close ends the stream
        let inbound = Box::pin(
            ws_rx
                .take_while(|frame| {
                    let open = matches!(frame, Ok(message) if !message.is_close());
                    async move { open }
                })
                .filter_map(|frame| async move {
                    match frame {
                        Ok(Message::Text(text)) => Some(text),
                        _ => None,
                    }
                }),
        );

        run_session(Arc::clone(&self.room), opened, inbound, outbound).await;

        // run_session dropped its sender; the forward task drains and closes
        if let Err(e) = forward_task.await {
            tracing::debug!(session_id = session_id, error = %e, "Forward task aborted");
        }

        Ok(session_id)
    }
}
