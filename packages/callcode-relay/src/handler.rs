//! WebSocket connection handler.
//!
//! The push side of the relay: one connection per participant, bound to a
//! call with `attach`, carrying that participant's outbound signals in and
//! the other participant's signals out.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage, SignalingMessage};
use crate::registry::normalize_call_code;
use crate::relay::RouteOutcome;
use crate::state::RelayState;

fn encode(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            None
        }
    }
}

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Waits for an `Attach` message binding it to a live call
/// 2. Spawns a sender task draining the member's outbound queue
/// 3. Processes incoming messages until either side closes
///
/// When the call is torn down the relay drops the member's queue, the
/// sender task finishes, and the connection is closed from here.
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Wait for Attach ───────────────────────────────────────────

    let (call_id, user_id, connection_id, rx) = loop {
        let reply = match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Attach { call_id, user_id }) => {
                    let call_id = normalize_call_code(&call_id);
                    if user_id.is_empty() {
                        ServerMessage::Error {
                            message: "user_id must not be empty".to_string(),
                        }
                    } else {
                        let (tx, rx) = mpsc::unbounded_channel::<ServerMessage>();
                        let connection_id = state.relay.next_connection_id();
                        match state.attach_member(&call_id, &user_id, connection_id, tx) {
                            Ok(_) => break (call_id, user_id, connection_id, rx),
                            Err(e) => ServerMessage::Error {
                                message: e.to_string(),
                            },
                        }
                    }
                }
                Ok(ClientMessage::Ping) => ServerMessage::Pong,
                Ok(_) => ServerMessage::Error {
                    message: "Must attach to a call before sending other messages".to_string(),
                },
                Err(e) => {
                    tracing::warn!("Failed to parse client message: {}", e);
                    ServerMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    }
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
                continue;
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                return; // Connection closed before attaching
            }
            _ => continue,
        };

        if let Some(frame) = encode(&reply) {
            if ws_sender.send(frame).await.is_err() {
                return;
            }
        }
    };

    tracing::info!(
        call_id = call_id.as_str(),
        user_id = user_id.as_str(),
        connection_id = connection_id,
        "WebSocket attached"
    );

    // ── Step 2: Spawn Sender Task ─────────────────────────────────────────

    let mut rx = rx;
    let mut sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Some(frame) = encode(&msg) {
                if ws_sender.send(frame).await.is_err() {
                    return; // Connection closed
                }
            }
        }
        // Queue dropped by the relay: the call is gone.
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // ── Step 3: Process Messages ──────────────────────────────────────────

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => {
                            handle_client_message(&state, &call_id, &user_id, client_msg);
                        }
                        Err(e) => {
                            tracing::warn!(
                                call_id = call_id.as_str(),
                                user_id = user_id.as_str(),
                                error = %e,
                                "Failed to parse client message"
                            );
                            state.send_to_member(
                                &call_id,
                                &user_id,
                                ServerMessage::Error {
                                    message: format!("Invalid message format: {}", e),
                                },
                            );
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(user_id = user_id.as_str(), "Client closed connection");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(user_id = user_id.as_str(), error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {} // Binary, Ping, Pong: ignored
            },
            _ = &mut sender_task => {
                tracing::info!(
                    call_id = call_id.as_str(),
                    user_id = user_id.as_str(),
                    "Relay channel closed, dropping connection"
                );
                break;
            }
        }
    }

    // ── Step 4: Cleanup ───────────────────────────────────────────────────

    state.detach_member(&call_id, &user_id, connection_id);
    sender_task.abort();
    tracing::info!(call_id = call_id.as_str(), user_id = user_id.as_str(), "WebSocket disconnected");
}

/// Handle a parsed client message from an attached member.
fn handle_client_message(state: &RelayState, call_id: &str, user_id: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::Attach { .. } => {
            state.send_to_member(
                call_id,
                user_id,
                ServerMessage::Error {
                    message: "Already attached".to_string(),
                },
            );
        }

        ClientMessage::Signal {
            kind,
            to,
            payload,
            generation,
        } => {
            let message = SignalingMessage {
                kind,
                from: user_id.to_string(),
                to,
                payload,
                session_id: call_id.to_string(),
                generation,
            };

            match state.relay_signal(message) {
                Ok(RouteOutcome::Delivered(_)) => {}
                Ok(RouteOutcome::Buffered) => {
                    state.send_to_member(
                        call_id,
                        user_id,
                        ServerMessage::Ack {
                            id: format!("signal_buffered_{:?}", kind).to_lowercase(),
                        },
                    );
                }
                Err(e) => {
                    state.send_to_member(
                        call_id,
                        user_id,
                        ServerMessage::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
        }

        ClientMessage::Ping => {
            state.send_to_member(call_id, user_id, ServerMessage::Pong);
        }
    }
}
