// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory repositories for tests and local development
//! (`MUL_IN_ONE_SESSION_REPO=memory`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::crypto::KeyCipher;
use crate::models::{
    normalize_handle, ApiProfileRecord, MessageRecord, NewApiProfile, NewPersona, NewSession,
    PersonaApiConfig, PersonaRecord, PersonaSettings, SenderKind, SessionPatch, SessionRecord,
};
use crate::repository::{PersonaRepository, SessionRepository};
use crate::{Result, StoreError};

// ─── Personas ─────────────────────────────────────────────────────────────────

struct StoredProfile {
    record: ApiProfileRecord,
    api_key_cipher: String,
}

struct PersonaInner {
    next_profile_id: i64,
    next_persona_id: i64,
    profiles: Vec<StoredProfile>,
    personas: Vec<PersonaRecord>,
}

pub struct InMemoryPersonaRepository {
    cipher: KeyCipher,
    default_memory_window: i32,
    default_max_agents: i32,
    inner: Mutex<PersonaInner>,
}

impl InMemoryPersonaRepository {
    pub fn new(cipher: KeyCipher, default_memory_window: i32, default_max_agents: i32) -> Self {
        Self {
            cipher,
            default_memory_window,
            default_max_agents,
            inner: Mutex::new(PersonaInner {
                next_profile_id: 1,
                next_persona_id: 1,
                profiles: Vec::new(),
                personas: Vec::new(),
            }),
        }
    }

    fn api_config_for(&self, inner: &PersonaInner, profile_id: Option<i64>) -> Option<PersonaApiConfig> {
        let profile_id = profile_id?;
        let p = inner.profiles.iter().find(|p| p.record.id == profile_id)?;
        let key = self.cipher.decrypt(&p.api_key_cipher);
        Some(PersonaApiConfig {
            model: Some(p.record.model.clone()),
            base_url: Some(p.record.base_url.clone()),
            api_key: (!key.is_empty()).then_some(key),
            temperature: p.record.temperature,
        })
    }
}

impl Default for InMemoryPersonaRepository {
    fn default() -> Self {
        Self::new(KeyCipher::new(""), 8, 2)
    }
}

#[async_trait]
impl PersonaRepository for InMemoryPersonaRepository {
    async fn create_profile(&self, username: &str, new: NewApiProfile) -> Result<ApiProfileRecord> {
        let mut inner = self.inner.lock().expect("persona repo lock");
        let id = inner.next_profile_id;
        inner.next_profile_id += 1;
        let record = ApiProfileRecord {
            id,
            username: username.to_string(),
            name: new.name,
            base_url: new.base_url,
            model: new.model,
            temperature: new.temperature,
            embedding_model: new.embedding_model,
            embedding_dimension: new.embedding_dimension,
            created_at: Utc::now(),
            api_key_preview: new.api_key.as_deref().and_then(KeyCipher::mask),
        };
        let api_key_cipher = new.api_key.map(|k| self.cipher.encrypt(&k)).unwrap_or_default();
        inner.profiles.push(StoredProfile { record: record.clone(), api_key_cipher });
        Ok(record)
    }

    async fn list_profiles(&self, username: &str) -> Result<Vec<ApiProfileRecord>> {
        let inner = self.inner.lock().expect("persona repo lock");
        Ok(inner
            .profiles
            .iter()
            .filter(|p| p.record.username == username)
            .map(|p| p.record.clone())
            .collect())
    }

    async fn get_profile(
        &self,
        username: &str,
        profile_id: i64,
    ) -> Result<Option<ApiProfileRecord>> {
        let inner = self.inner.lock().expect("persona repo lock");
        Ok(inner
            .profiles
            .iter()
            .find(|p| p.record.username == username && p.record.id == profile_id)
            .map(|p| p.record.clone()))
    }

    async fn delete_profile(&self, username: &str, profile_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("persona repo lock");
        let before = inner.profiles.len();
        inner
            .profiles
            .retain(|p| !(p.record.username == username && p.record.id == profile_id));
        if inner.profiles.len() == before {
            return Err(StoreError::ProfileNotFound(profile_id));
        }
        Ok(())
    }

    async fn create_persona(&self, username: &str, new: NewPersona) -> Result<PersonaRecord> {
        let mut inner = self.inner.lock().expect("persona repo lock");
        let id = inner.next_persona_id;
        inner.next_persona_id += 1;
        let record = PersonaRecord {
            id,
            username: username.to_string(),
            handle: normalize_handle(new.handle.as_deref(), &new.name),
            name: new.name,
            prompt: new.prompt,
            tone: new.tone,
            proactivity: new.proactivity,
            memory_window: new.memory_window.unwrap_or(self.default_memory_window),
            max_agents_per_turn: new.max_agents_per_turn.unwrap_or(self.default_max_agents),
            is_default: new.is_default,
            background: new.background,
            api_profile_id: new.api_profile_id,
            api: None,
        };
        inner.personas.push(record.clone());
        Ok(record)
    }

    async fn list_personas(&self, username: &str) -> Result<Vec<PersonaRecord>> {
        let inner = self.inner.lock().expect("persona repo lock");
        let mut personas: Vec<PersonaRecord> = inner
            .personas
            .iter()
            .filter(|p| p.username == username)
            .cloned()
            .collect();
        personas.sort_by_key(|p| p.id);
        Ok(personas)
    }

    async fn get_persona(&self, username: &str, persona_id: i64) -> Result<Option<PersonaRecord>> {
        let inner = self.inner.lock().expect("persona repo lock");
        Ok(inner
            .personas
            .iter()
            .find(|p| p.username == username && p.id == persona_id)
            .cloned())
    }

    async fn delete_persona(&self, username: &str, persona_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("persona repo lock");
        let before = inner.personas.len();
        inner.personas.retain(|p| !(p.username == username && p.id == persona_id));
        if inner.personas.len() == before {
            return Err(StoreError::PersonaNotFound(persona_id));
        }
        Ok(())
    }

    async fn load_persona_settings(&self, username: &str) -> Result<PersonaSettings> {
        let inner = self.inner.lock().expect("persona repo lock");
        let mut personas: Vec<PersonaRecord> = inner
            .personas
            .iter()
            .filter(|p| p.username == username)
            .cloned()
            .collect();
        personas.sort_by_key(|p| p.id);
        for p in &mut personas {
            p.api = self.api_config_for(&inner, p.api_profile_id);
        }
        let default = personas.iter().find(|p| p.is_default);
        let max_agents = default
            .map(|p| p.max_agents_per_turn)
            .unwrap_or(self.default_max_agents);
        let memory_window = default
            .map(|p| p.memory_window)
            .unwrap_or(self.default_memory_window);
        Ok(PersonaSettings { personas, max_agents_per_turn: max_agents, memory_window })
    }
}

// ─── Sessions ─────────────────────────────────────────────────────────────────

struct StoredSession {
    record: SessionRecord,
    participant_ids: Vec<i64>,
}

struct SessionInner {
    sessions: HashMap<String, StoredSession>,
    messages: HashMap<String, Vec<MessageRecord>>,
}

pub struct InMemorySessionRepository {
    personas: Arc<dyn PersonaRepository>,
    inner: Mutex<SessionInner>,
}

impl InMemorySessionRepository {
    pub fn new(personas: Arc<dyn PersonaRepository>) -> Self {
        Self {
            personas,
            inner: Mutex::new(SessionInner { sessions: HashMap::new(), messages: HashMap::new() }),
        }
    }

    async fn resolve_participants(
        &self,
        username: &str,
        ids: &[i64],
    ) -> Result<Vec<PersonaRecord>> {
        let mut all = self.personas.list_personas(username).await?;
        all.retain(|p| ids.contains(&p.id));
        all.sort_by_key(|p| p.id);
        Ok(all)
    }

    async fn to_record(&self, stored: &SessionRecord, ids: &[i64]) -> Result<SessionRecord> {
        let mut record = stored.clone();
        record.participants = self.resolve_participants(&record.username, ids).await?;
        Ok(record)
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, username: &str, new: NewSession) -> Result<SessionRecord> {
        let id = format!("sess-{}", Uuid::new_v4());
        let record = SessionRecord {
            id: id.clone(),
            username: username.to_string(),
            created_at: Utc::now(),
            title: new.title,
            user_display_name: new.user_display_name,
            user_handle: new.user_handle,
            user_persona: new.user_persona,
            participants: Vec::new(),
        };
        let ids = new.initial_persona_ids;
        {
            let mut inner = self.inner.lock().expect("session repo lock");
            inner.sessions.insert(
                id.clone(),
                StoredSession { record: record.clone(), participant_ids: ids.clone() },
            );
            inner.messages.insert(id.clone(), Vec::new());
        }
        self.to_record(&record, &ids).await
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let (record, ids) = {
            let inner = self.inner.lock().expect("session repo lock");
            match inner.sessions.get(session_id) {
                Some(s) => (s.record.clone(), s.participant_ids.clone()),
                None => return Ok(None),
            }
        };
        Ok(Some(self.to_record(&record, &ids).await?))
    }

    async fn list_sessions(&self, username: &str) -> Result<Vec<SessionRecord>> {
        let stored: Vec<(SessionRecord, Vec<i64>)> = {
            let inner = self.inner.lock().expect("session repo lock");
            inner
                .sessions
                .values()
                .filter(|s| s.record.username == username)
                .map(|s| (s.record.clone(), s.participant_ids.clone()))
                .collect()
        };
        let mut out = Vec::with_capacity(stored.len());
        for (record, ids) in stored {
            out.push(self.to_record(&record, &ids).await?);
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn add_message(
        &self,
        session_id: &str,
        sender: &str,
        content: &str,
    ) -> Result<MessageRecord> {
        let mut inner = self.inner.lock().expect("session repo lock");
        if !inner.sessions.contains_key(session_id) {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            sender_kind: SenderKind::from_sender(sender),
            sender: sender.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        inner
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn list_messages(&self, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let inner = self.inner.lock().expect("session repo lock");
        if !inner.sessions.contains_key(session_id) {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        let msgs = inner.messages.get(session_id).cloned().unwrap_or_default();
        let start = msgs.len().saturating_sub(limit);
        Ok(msgs[start..].to_vec())
    }

    async fn update_user_persona(
        &self,
        session_id: &str,
        user_persona: Option<String>,
    ) -> Result<SessionRecord> {
        let (record, ids) = {
            let mut inner = self.inner.lock().expect("session repo lock");
            let stored = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            stored.record.user_persona = user_persona;
            (stored.record.clone(), stored.participant_ids.clone())
        };
        self.to_record(&record, &ids).await
    }

    async fn update_participants(
        &self,
        session_id: &str,
        persona_ids: &[i64],
    ) -> Result<SessionRecord> {
        let record = {
            let mut inner = self.inner.lock().expect("session repo lock");
            let stored = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            stored.participant_ids = persona_ids.to_vec();
            stored.record.clone()
        };
        self.to_record(&record, persona_ids).await
    }

    async fn update_metadata(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<SessionRecord> {
        let (record, ids) = {
            let mut inner = self.inner.lock().expect("session repo lock");
            let stored = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            if let Some(title) = patch.title {
                stored.record.title = Some(title);
            }
            if let Some(name) = patch.user_display_name {
                stored.record.user_display_name = Some(name);
            }
            if let Some(handle) = patch.user_handle {
                stored.record.user_handle = Some(handle);
            }
            if let Some(persona) = patch.user_persona {
                stored.record.user_persona = Some(persona);
            }
            (stored.record.clone(), stored.participant_ids.clone())
        };
        self.to_record(&record, &ids).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("session repo lock");
        if inner.sessions.remove(session_id).is_none() {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        inner.messages.remove(session_id);
        Ok(())
    }

    async fn delete_sessions(&self, session_ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().expect("session repo lock");
        for id in session_ids {
            inner.sessions.remove(id);
            inner.messages.remove(id);
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn repos() -> (Arc<InMemoryPersonaRepository>, InMemorySessionRepository) {
        let personas = Arc::new(InMemoryPersonaRepository::default());
        let sessions = InMemorySessionRepository::new(personas.clone());
        (personas, sessions)
    }

    #[tokio::test]
    async fn create_and_get_session() {
        let (_personas, sessions) = repos();
        let created = sessions.create("alice", NewSession::default()).await.unwrap();
        let fetched = sessions.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.username, "alice");
    }

    #[tokio::test]
    async fn get_unknown_session_is_none() {
        let (_p, sessions) = repos();
        assert!(sessions.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn add_message_to_unknown_session_fails() {
        let (_p, sessions) = repos();
        let err = sessions.add_message("missing", "user", "hi").await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn messages_kept_in_order_and_limited() {
        let (_p, sessions) = repos();
        let s = sessions.create("alice", NewSession::default()).await.unwrap();
        for i in 0..5 {
            sessions.add_message(&s.id, "user", &format!("m{i}")).await.unwrap();
        }
        let msgs = sessions.list_messages(&s.id, 3).await.unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].content, "m2");
        assert_eq!(msgs[2].content, "m4");
    }

    #[tokio::test]
    async fn participants_ordered_by_persona_id() {
        let (personas, sessions) = repos();
        let a = personas.create_persona("alice", NewPersona::named("Ada")).await.unwrap();
        let b = personas.create_persona("alice", NewPersona::named("Ben")).await.unwrap();
        let c = personas.create_persona("alice", NewPersona::named("Cyn")).await.unwrap();
        let s = sessions.create("alice", NewSession::default()).await.unwrap();
        let updated = sessions
            .update_participants(&s.id, &[c.id, a.id, b.id])
            .await
            .unwrap();
        let ids: Vec<i64> = updated.participants.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn participants_survive_reload() {
        let (personas, sessions) = repos();
        let a = personas.create_persona("alice", NewPersona::named("Ada")).await.unwrap();
        let b = personas.create_persona("alice", NewPersona::named("Ben")).await.unwrap();
        let s = sessions
            .create(
                "alice",
                NewSession { initial_persona_ids: vec![b.id, a.id], ..Default::default() },
            )
            .await
            .unwrap();
        let again = sessions.get(&s.id).await.unwrap().unwrap();
        let ids: Vec<i64> = again.participants.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn metadata_patch_updates_only_given_fields() {
        let (_p, sessions) = repos();
        let s = sessions
            .create(
                "alice",
                NewSession { title: Some("old".into()), ..Default::default() },
            )
            .await
            .unwrap();
        let updated = sessions
            .update_metadata(
                &s.id,
                SessionPatch { user_handle: Some("al".into()), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(updated.title.as_deref(), Some("old"));
        assert_eq!(updated.user_handle.as_deref(), Some("al"));
    }

    #[tokio::test]
    async fn profile_listing_masks_key() {
        let (personas, _s) = repos();
        let p = personas
            .create_profile(
                "alice",
                NewApiProfile {
                    name: "main".into(),
                    base_url: "https://api.example.com/v1".into(),
                    model: "m".into(),
                    temperature: None,
                    api_key: Some("sk-secret-key-9876".into()),
                    embedding_model: None,
                    embedding_dimension: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(p.api_key_preview.as_deref(), Some("****9876"));
    }

    #[tokio::test]
    async fn load_persona_settings_decrypts_api_config() {
        let personas = Arc::new(InMemoryPersonaRepository::new(KeyCipher::new("s3cret"), 8, 2));
        let profile = personas
            .create_profile(
                "alice",
                NewApiProfile {
                    name: "main".into(),
                    base_url: "https://api.example.com/v1".into(),
                    model: "chat-large".into(),
                    temperature: Some(0.7),
                    api_key: Some("sk-abc".into()),
                    embedding_model: None,
                    embedding_dimension: None,
                },
            )
            .await
            .unwrap();
        let mut new = NewPersona::named("Ada");
        new.api_profile_id = Some(profile.id);
        personas.create_persona("alice", new).await.unwrap();

        let settings = personas.load_persona_settings("alice").await.unwrap();
        let api = settings.personas[0].api.as_ref().unwrap();
        assert_eq!(api.api_key.as_deref(), Some("sk-abc"));
        assert_eq!(api.model.as_deref(), Some("chat-large"));
    }

    #[tokio::test]
    async fn default_persona_drives_settings() {
        let (personas, _s) = repos();
        let mut new = NewPersona::named("Lead");
        new.is_default = true;
        new.memory_window = Some(-1);
        new.max_agents_per_turn = Some(-1);
        personas.create_persona("alice", new).await.unwrap();
        let settings = personas.load_persona_settings("alice").await.unwrap();
        assert_eq!(settings.memory_window, -1);
        assert_eq!(settings.max_agents_per_turn, -1);
    }

    #[tokio::test]
    async fn delete_sessions_is_idempotent() {
        let (_p, sessions) = repos();
        let s = sessions.create("alice", NewSession::default()).await.unwrap();
        sessions
            .delete_sessions(&[s.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert!(sessions.get(&s.id).await.unwrap().is_none());
    }
}
