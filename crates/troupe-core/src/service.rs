// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session orchestration entry point.
//!
//! Owns the per-session workers, applies the enqueue semantics (explicit
//! stop, interrupt-on-overlap), and prepares history before a message
//! enters a worker's queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use troupe_store::{
    HistoryEntry, MessageRecord, NewSession, SessionMessage, SessionPatch, SessionRecord,
    SessionRepository, StoreError,
};

use crate::adapter::RuntimeAdapter;
use crate::events::SessionStreamEvent;
use crate::interrupts::InterruptRegistry;
use crate::stop::is_explicit_stop;
use crate::worker::SessionRuntime;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionNotFound(id) => Self::SessionNotFound(id),
            other => Self::Store(other),
        }
    }
}

pub struct SessionService {
    repository: Arc<dyn SessionRepository>,
    adapter: Arc<dyn RuntimeAdapter>,
    interrupts: InterruptRegistry,
    history_limit: usize,
    runtimes: Mutex<HashMap<String, Arc<SessionRuntime>>>,
}

impl SessionService {
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        adapter: Arc<dyn RuntimeAdapter>,
        interrupts: InterruptRegistry,
        history_limit: usize,
    ) -> Self {
        Self {
            repository,
            adapter,
            interrupts,
            history_limit,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_session(
        &self,
        username: &str,
        new: NewSession,
    ) -> Result<SessionRecord, ServiceError> {
        let record = self.repository.create(username, new).await?;
        self.ensure_runtime(&record);
        Ok(record)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord, ServiceError> {
        self.repository
            .get(session_id)
            .await?
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list_sessions(&self, username: &str) -> Result<Vec<SessionRecord>, ServiceError> {
        Ok(self.repository.list_sessions(username).await?)
    }

    pub async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, ServiceError> {
        Ok(self.repository.list_messages(session_id, limit).await?)
    }

    pub async fn update_metadata(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<SessionRecord, ServiceError> {
        let record = self.repository.update_metadata(session_id, patch).await?;
        self.ensure_runtime(&record);
        Ok(record)
    }

    pub async fn update_participants(
        &self,
        session_id: &str,
        persona_ids: &[i64],
    ) -> Result<SessionRecord, ServiceError> {
        let record = self.repository.update_participants(session_id, persona_ids).await?;
        self.ensure_runtime(&record);
        Ok(record)
    }

    pub async fn update_user_persona(
        &self,
        session_id: &str,
        user_persona: Option<String>,
    ) -> Result<SessionRecord, ServiceError> {
        let record = self.repository.update_user_persona(session_id, user_persona).await?;
        self.ensure_runtime(&record);
        Ok(record)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ServiceError> {
        if let Some(runtime) = self.runtimes.lock().expect("runtimes lock").remove(session_id) {
            runtime.stop();
        }
        self.repository.delete_session(session_id).await?;
        Ok(())
    }

    pub async fn delete_sessions(&self, session_ids: &[String]) -> Result<(), ServiceError> {
        {
            let mut runtimes = self.runtimes.lock().expect("runtimes lock");
            for id in session_ids {
                if let Some(runtime) = runtimes.remove(id) {
                    runtime.stop();
                }
            }
        }
        self.repository.delete_sessions(session_ids).await?;
        Ok(())
    }

    /// Accept a user message for processing.
    ///
    /// While a turn is streaming, an explicit stop command force-stops the
    /// session (and is not recorded in history); any other message sets the
    /// interrupt flag so the current turn yields after its round, then the
    /// message is stored, enriched with history, and queued.
    pub async fn enqueue_message(&self, mut message: SessionMessage) -> Result<(), ServiceError> {
        let record = self.get_session(&message.session_id).await?;
        let runtime = self.ensure_runtime(&record);

        if runtime.is_streaming() && is_explicit_stop(&message.content) {
            runtime.force_stop(Some("user_explicit_stop")).await;
            return Ok(());
        }
        if runtime.is_streaming() {
            self.interrupts.request(&record.id);
        }

        self.repository
            .add_message(&record.id, &message.sender, &message.content)
            .await?;

        let stored = self.repository.list_messages(&record.id, self.history_limit).await?;
        let mut history: Vec<HistoryEntry> = stored
            .into_iter()
            .map(|m| HistoryEntry { sender: m.sender, content: m.content })
            .collect();
        if let Some(user_persona) = &record.user_persona {
            history.insert(
                0,
                HistoryEntry { sender: "user_persona".into(), content: user_persona.clone() },
            );
        }
        message.history = Some(history);
        message.user_persona = record.user_persona.clone();
        if message.target_personas.is_none() && !record.participants.is_empty() {
            message.target_personas =
                Some(record.participants.iter().map(|p| p.handle.clone()).collect());
        }

        let preview: String = message.content.chars().take(80).collect();
        info!(
            session = %record.id,
            preview = %preview,
            truncated = message.content.chars().count() > 80,
            "message queued"
        );
        runtime.enqueue(message);
        Ok(())
    }

    /// Subscribe to a session's event stream.
    pub async fn stream_responses(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<SessionStreamEvent>, ServiceError> {
        let record = self.get_session(session_id).await?;
        let runtime = self.ensure_runtime(&record);
        Ok(runtime.subscribe())
    }

    /// Force stop an active session's processing.  Idempotent when no
    /// worker exists.
    pub async fn stop_session(
        &self,
        session_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ServiceError> {
        self.get_session(session_id).await?;
        let runtime = self.runtimes.lock().expect("runtimes lock").get(session_id).cloned();
        if let Some(runtime) = runtime {
            runtime.force_stop(reason).await;
        }
        Ok(())
    }

    fn ensure_runtime(&self, record: &SessionRecord) -> Arc<SessionRuntime> {
        let mut runtimes = self.runtimes.lock().expect("runtimes lock");
        let runtime = match runtimes.get(&record.id) {
            Some(rt) => {
                rt.update_record(record.clone());
                rt.clone()
            }
            None => {
                let rt = SessionRuntime::new(
                    record.clone(),
                    self.adapter.clone(),
                    self.repository.clone(),
                );
                runtimes.insert(record.id.clone(), rt.clone());
                rt
            }
        };
        runtime.start();
        runtime
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
