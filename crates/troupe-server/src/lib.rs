// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! REST + WebSocket surface.
//!
//! Thin JSON routes over [`SessionService`]; all orchestration lives in the
//! engine.  WebSocket subscribers receive serialized `{event, data}` frames
//! and are disconnected when they lag behind the broadcast buffer.

mod error;
mod routes;
mod ws;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tracing::info;

use troupe_core::SessionService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SessionService>,
}

/// Build the application router.
pub fn app(service: Arc<SessionService>) -> Router {
    let state = AppState { service };
    Router::new()
        .route("/sessions", post(routes::create_session).get(routes::list_sessions))
        .route(
            "/sessions/:id",
            get(routes::get_session)
                .patch(routes::patch_session)
                .delete(routes::delete_session),
        )
        .route("/sessions/:id/participants", put(routes::put_participants))
        .route("/sessions/batch-delete", post(routes::batch_delete))
        .route(
            "/sessions/:id/messages",
            post(routes::post_message).get(routes::list_messages),
        )
        .route("/ws/sessions/:id", get(ws::ws_handler))
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(service: Arc<SessionService>, listen_addr: &str) -> anyhow::Result<()> {
    let router = app(service);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}
