// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use crate::models::{
    ApiProfileRecord, MessageRecord, NewApiProfile, NewPersona, NewSession, PersonaRecord,
    PersonaSettings, SessionPatch, SessionRecord,
};
use crate::Result;

/// Sessions and their messages.
///
/// All mutations against an unknown session return
/// [`StoreError::SessionNotFound`](crate::StoreError::SessionNotFound).
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, username: &str, new: NewSession) -> Result<SessionRecord>;

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    async fn list_sessions(&self, username: &str) -> Result<Vec<SessionRecord>>;

    async fn add_message(
        &self,
        session_id: &str,
        sender: &str,
        content: &str,
    ) -> Result<MessageRecord>;

    /// The most recent `limit` messages, in chronological order.
    async fn list_messages(&self, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>>;

    async fn update_user_persona(
        &self,
        session_id: &str,
        user_persona: Option<String>,
    ) -> Result<SessionRecord>;

    /// Replace the participant set; participants are returned ordered by
    /// persona id.
    async fn update_participants(
        &self,
        session_id: &str,
        persona_ids: &[i64],
    ) -> Result<SessionRecord>;

    async fn update_metadata(&self, session_id: &str, patch: SessionPatch)
        -> Result<SessionRecord>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;

    async fn delete_sessions(&self, session_ids: &[String]) -> Result<()>;
}

/// Personas and API credential profiles, per user.
#[async_trait]
pub trait PersonaRepository: Send + Sync {
    async fn create_profile(&self, username: &str, new: NewApiProfile) -> Result<ApiProfileRecord>;

    async fn list_profiles(&self, username: &str) -> Result<Vec<ApiProfileRecord>>;

    async fn get_profile(&self, username: &str, profile_id: i64)
        -> Result<Option<ApiProfileRecord>>;

    async fn delete_profile(&self, username: &str, profile_id: i64) -> Result<()>;

    async fn create_persona(&self, username: &str, new: NewPersona) -> Result<PersonaRecord>;

    async fn list_personas(&self, username: &str) -> Result<Vec<PersonaRecord>>;

    async fn get_persona(&self, username: &str, persona_id: i64) -> Result<Option<PersonaRecord>>;

    async fn delete_persona(&self, username: &str, persona_id: i64) -> Result<()>;

    /// Resolve the user's full persona set with decrypted API configs and
    /// the runtime defaults (from the default persona when one exists).
    async fn load_persona_settings(&self, username: &str) -> Result<PersonaSettings>;
}
