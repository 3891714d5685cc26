// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use troupe_store::{MessageRecord, NewSession, SessionMessage, SessionPatch, SessionRecord};

use crate::error::{ApiError, AppJson};
use crate::AppState;

// ─── Wire shapes ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionBody {
    pub username: String,
    #[serde(default)]
    pub user_persona: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub user_display_name: Option<String>,
    #[serde(default)]
    pub user_handle: Option<String>,
    #[serde(default)]
    pub initial_persona_ids: Vec<i64>,
}

#[derive(Deserialize)]
pub struct ListSessionsQuery {
    pub username: String,
}

#[derive(Deserialize)]
pub struct PatchSessionBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub user_display_name: Option<String>,
    #[serde(default)]
    pub user_handle: Option<String>,
    #[serde(default)]
    pub user_persona: Option<String>,
}

#[derive(Deserialize)]
pub struct PutParticipantsBody {
    pub persona_ids: Vec<i64>,
}

#[derive(Deserialize)]
pub struct BatchDeleteBody {
    pub session_ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct PostMessageBody {
    pub content: String,
    #[serde(default)]
    pub target_personas: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default = "default_message_limit")]
    pub limit: usize,
}

fn default_message_limit() -> usize {
    50
}

#[derive(Serialize)]
pub struct ParticipantSummary {
    pub id: i64,
    pub name: String,
    pub handle: String,
}

#[derive(Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub username: String,
    pub created_at: String,
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
    pub participants: Vec<ParticipantSummary>,
}

impl From<SessionRecord> for SessionSummary {
    fn from(r: SessionRecord) -> Self {
        Self {
            session_id: r.id,
            username: r.username,
            created_at: r.created_at.to_rfc3339(),
            title: r.title,
            user_display_name: r.user_display_name,
            user_handle: r.user_handle,
            user_persona: r.user_persona,
            participants: r
                .participants
                .into_iter()
                .map(|p| ParticipantSummary { id: p.id, name: p.name, handle: p.handle })
                .collect(),
        }
    }
}

#[derive(Serialize)]
pub struct MessageSummary {
    pub id: String,
    pub session_id: String,
    pub sender_type: String,
    pub sender: String,
    pub content: String,
    pub created_at: String,
}

impl From<MessageRecord> for MessageSummary {
    fn from(m: MessageRecord) -> Self {
        Self {
            id: m.id,
            session_id: m.session_id,
            sender_type: m.sender_kind.as_str().to_string(),
            sender: m.sender,
            content: m.content,
            created_at: m.created_at.to_rfc3339(),
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

pub async fn create_session(
    State(state): State<AppState>,
    AppJson(body): AppJson<CreateSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.username.is_empty() {
        return Err(ApiError::BadRequest("username must not be empty".into()));
    }
    let record = state
        .service
        .create_session(
            &body.username,
            NewSession {
                user_persona: body.user_persona,
                title: body.title,
                user_display_name: body.user_display_name,
                user_handle: body.user_handle,
                initial_persona_ids: body.initial_persona_ids,
            },
        )
        .await?;
    Ok(Json(json!({ "session_id": record.id })))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.service.list_sessions(&query.username).await?;
    let out: Vec<SessionSummary> = sessions.into_iter().map(Into::into).collect();
    Ok(Json(out))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.service.get_session(&id).await?;
    Ok(Json(SessionSummary::from(record)))
}

pub async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    AppJson(body): AppJson<PatchSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .service
        .update_metadata(
            &id,
            SessionPatch {
                title: body.title,
                user_display_name: body.user_display_name,
                user_handle: body.user_handle,
                user_persona: body.user_persona,
            },
        )
        .await?;
    Ok(Json(SessionSummary::from(record)))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn put_participants(
    State(state): State<AppState>,
    Path(id): Path<String>,
    AppJson(body): AppJson<PutParticipantsBody>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.service.update_participants(&id, &body.persona_ids).await?;
    Ok(Json(SessionSummary::from(record)))
}

pub async fn batch_delete(
    State(state): State<AppState>,
    AppJson(body): AppJson<BatchDeleteBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete_sessions(&body.session_ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    AppJson(body): AppJson<PostMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.content.is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }
    let mut message = SessionMessage::new(id, "user", body.content);
    message.target_personas = body.target_personas;
    state.service.enqueue_message(message).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.service.list_messages(&id, query.limit).await?;
    let out: Vec<MessageSummary> = messages.into_iter().map(Into::into).collect();
    Ok(Json(out))
}
