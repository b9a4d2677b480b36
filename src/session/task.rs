//! Per-session task
//!
//! One task per connection. It is the only writer of the session state:
//! requests, room events and transport notices are all applied here, one at a
//! time.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use super::handler::SessionHandler;
use crate::protocol::{decode_request, ServerMessage};
use crate::room::{OpenedSession, Room};

/// Run a session until the inbound stream ends or the peer stops reading
///
/// `inbound` yields request frames as text; every response and event is
/// pushed to `outbound` in order. The session is torn down on return.
pub async fn run_session<S>(
    room: Arc<Room>,
    opened: OpenedSession,
    mut inbound: S,
    outbound: mpsc::Sender<ServerMessage>,
) where
    S: Stream<Item = String> + Unpin,
{
    let OpenedSession {
        state,
        mut events,
        mut notices,
    } = opened;
    let stats = Arc::clone(room.stats());
    let mut handler = SessionHandler::new(Arc::clone(&room), state);
    let session_id = handler.id();

    for event in handler.greeting().await {
        if outbound.send(ServerMessage::Event(event)).await.is_err() {
            handler.close().await;
            return;
        }
    }

    loop {
        let messages: Vec<ServerMessage> = tokio::select! {
            frame = inbound.next() => {
                let Some(text) = frame else {
                    break;
                };
                stats.request();
                let response = match decode_request(&text) {
                    Ok((id, request)) => {
                        let method = request.method();
                        match handler.handle(request).await {
                            Ok(data) => ServerMessage::ok(id, data),
                            Err(e) => {
                                tracing::debug!(
                                    session_id = session_id,
                                    method = method,
                                    error = %e,
                                    "Request failed"
                                );
                                ServerMessage::error(id, &e)
                            }
                        }
                    }
                    Err((id, e)) => {
                        tracing::debug!(session_id = session_id, error = %e, "Bad request frame");
                        ServerMessage::error(id, &e)
                    }
                };
                if matches!(response, ServerMessage::Response { outcome: Err(_), .. }) {
                    stats.request_failed();
                }
                vec![response]
            }
            event = events.recv() => match event {
                Ok(event) => handler
                    .on_room_event(&event)
                    .map(ServerMessage::Event)
                    .into_iter()
                    .collect(),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        session_id = session_id,
                        skipped = skipped,
                        "Session lagged behind room events, resyncing"
                    );
                    stats.events_dropped(skipped);
                    // Events still queued are covered by the resync
                    events = events.resubscribe();
                    handler
                        .resync()
                        .await
                        .into_iter()
                        .map(ServerMessage::Event)
                        .collect()
                }
                Err(RecvError::Closed) => break,
            },
            Some(notice) = notices.recv() => {
                handler.on_transport_notice(notice).await;
                Vec::new()
            }
        };

        let mut delivered = true;
        for message in messages {
            if outbound.send(message).await.is_err() {
                tracing::debug!(session_id = session_id, "Outbound channel closed");
                delivered = false;
                break;
            }
        }
        if !delivered {
            break;
        }
    }

    handler.close().await;
}
