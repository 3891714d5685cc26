// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket bridge: streams session events to browser subscribers.
//!
//! Frames are serialized [`SessionStreamEvent`]s.  An unknown session
//! closes the socket with policy code 1008 right after the upgrade.  A
//! subscriber that lags behind the broadcast buffer is disconnected rather
//! than slowing the worker down.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use troupe_core::SessionStreamEvent;

use crate::AppState;

const POLICY_VIOLATION: u16 = 1008;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let subscription = state.service.stream_responses(&id).await;
    ws.on_upgrade(move |socket| async move {
        match subscription {
            Ok(events) => handle_socket(socket, id, events).await,
            Err(_) => {
                let _ = socket_close(socket, "session not found").await;
            }
        }
    })
}

async fn socket_close(mut socket: WebSocket, reason: &str) -> Result<(), axum::Error> {
    socket
        .send(Message::Close(Some(CloseFrame {
            code: POLICY_VIOLATION,
            reason: reason.to_string().into(),
        })))
        .await
}

async fn handle_socket(
    mut socket: WebSocket,
    session_id: String,
    mut events: broadcast::Receiver<SessionStreamEvent>,
) {
    info!(session = %session_id, "WebSocket subscriber connected");

    loop {
        tokio::select! {
            // Incoming frames: only keepalives matter; messages enter via REST.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = %session_id, "WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            result = events.recv() => {
                match result {
                    Ok(ev) => {
                        if send_event(&mut socket, &ev).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Drop-oldest overflow policy: a slow subscriber is
                        // disconnected instead of blocking the worker.
                        warn!(session = %session_id, "subscriber lagged by {n} events; disconnecting");
                        let _ = socket_close(socket, "event stream lagged").await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!(session = %session_id, "WebSocket subscriber disconnected");
}

async fn send_event(socket: &mut WebSocket, ev: &SessionStreamEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(ev) {
        Ok(json) => socket.send(Message::Text(json)).await,
        Err(e) => {
            warn!("failed to serialize event: {e}");
            Ok(())
        }
    }
}
