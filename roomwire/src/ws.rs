//! WebSocket signaling endpoint
//!
//! One socket is one signaling connection. Text frames carry JSON requests;
//! responses and room events travel back through a bounded queue drained by a
//! writer task. Whatever ends the connection (close frame, socket error, idle
//! timeout, server shutdown), the session is always disconnected.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use roomwire_sfu::{ClientRequest, Response, ServerMessage, Session, SfuError};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::server::AppState;

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.server.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut session, mut events) = state.gateway.connect();
    let connection_id = session.connection_id().clone();
    info!(connection_id = %connection_id, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();

    // Bounded outbound queue: responses and events share it in order
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.server.outbound_queue);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode server message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let idle_timeout = Duration::from_secs(state.server.idle_timeout_seconds);
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            frame = stream.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_text(&mut session, text.as_str()).await;
                        if tx.send(ServerMessage::Response(response)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(connection_id = %connection_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Ping/pong are answered by the protocol layer
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            Some(event) = events.recv() => {
                // Slow client: drop the event rather than stall the room
                if let Err(mpsc::error::TrySendError::Closed(_)) =
                    tx.try_send(ServerMessage::Event(event))
                {
                    break;
                }
            }
            () = &mut idle => {
                info!(connection_id = %connection_id, "WebSocket idle timeout");
                break;
            }
            _ = shutdown.changed() => {
                debug!(connection_id = %connection_id, "Closing WebSocket for shutdown");
                break;
            }
        }
    }

    session.disconnect().await;
    drop(tx);
    let _ = writer.await;

    info!(connection_id = %connection_id, "WebSocket connection closed");
}

/// Decode one text frame and run it through the session
async fn handle_text(session: &mut Session, text: &str) -> Response {
    match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => session.handle(request).await,
        Err(e) => {
            // Answer under the caller's id when it is at least readable
            let id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|value| value.get("id").and_then(Value::as_u64))
                .unwrap_or(0);
            Response::failure(id, &SfuError::InvalidRequest(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomwire_sfu::{ErrorCode, LocalEngine, SfuConfig, SignalingGateway};
    use std::sync::Arc;

    fn session() -> Session {
        let gateway = SignalingGateway::new(SfuConfig::default(), Arc::new(LocalEngine::new()));
        gateway.connect().0
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_request_id() {
        let mut session = session();
        let response = handle_text(&mut session, r#"{"id": 42, "type": "fly"}"#).await;

        assert_eq!(response.id, 42);
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_unparseable_frame() {
        let mut session = session();
        let response = handle_text(&mut session, "not json").await;

        assert_eq!(response.id, 0);
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn test_join_over_text_frame() {
        let mut session = session();
        let response = handle_text(
            &mut session,
            r#"{"id": 1, "type": "join-room", "roomId": "r1", "peerId": "alice"}"#,
        )
        .await;

        assert!(response.ok, "{response:?}");
        assert!(session.is_joined());
        session.disconnect().await;
    }
}
