// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who wrote a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Agent,
}

impl SenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    /// The literal sender name `user` is the user; everything else is an
    /// agent.
    pub fn from_sender(sender: &str) -> Self {
        if sender == "user" {
            Self::User
        } else {
            Self::Agent
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Self::User,
            _ => Self::Agent,
        }
    }
}

/// A persona as stored, including the joined API profile columns.
#[derive(Debug, Clone, Serialize)]
pub struct PersonaRecord {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub handle: String,
    pub prompt: String,
    pub tone: String,
    pub proactivity: f32,
    /// History entries fed to the LLM; `<= 0` means unlimited.
    pub memory_window: i32,
    /// Cap on simultaneous speakers; `<= 0` means all participants.
    pub max_agents_per_turn: i32,
    pub is_default: bool,
    pub background: Option<String>,
    pub api_profile_id: Option<i64>,
    /// Decrypted endpoint configuration, populated by
    /// `load_persona_settings`; absent in plain listings.
    #[serde(skip)]
    pub api: Option<PersonaApiConfig>,
}

/// Decrypted per-persona LLM endpoint configuration.
#[derive(Debug, Clone)]
pub struct PersonaApiConfig {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
}

/// An API credential profile as returned to callers.  The key itself never
/// leaves the store; only the `****{last4}` preview does.
#[derive(Debug, Clone, Serialize)]
pub struct ApiProfileRecord {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub api_key_preview: Option<String>,
}

/// Per-user persona set plus the runtime defaults resolved for that user.
#[derive(Debug, Clone)]
pub struct PersonaSettings {
    pub personas: Vec<PersonaRecord>,
    pub max_agents_per_turn: i32,
    pub memory_window: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
    /// Participating personas, ordered by persona id.
    pub participants: Vec<PersonaRecord>,
}

/// One stored message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub sender_kind: SenderKind,
    pub sender: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One `(sender, content)` pair attached as history to a queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sender: String,
    pub content: String,
}

/// A message travelling through a session worker's inbound queue.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub session_id: String,
    pub content: String,
    pub sender: String,
    /// Routing hint: persona handles this turn is addressed to.
    pub target_personas: Option<Vec<String>>,
    /// Recent history attached by the session service before enqueueing.
    pub history: Option<Vec<HistoryEntry>>,
    pub user_persona: Option<String>,
}

impl SessionMessage {
    pub fn new(session_id: impl Into<String>, sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            sender: sender.into(),
            target_personas: None,
            history: None,
            user_persona: None,
        }
    }
}

/// Fields for creating a session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub user_persona: Option<String>,
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub initial_persona_ids: Vec<i64>,
}

/// Partial metadata update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
}

/// Fields for creating a persona.
#[derive(Debug, Clone)]
pub struct NewPersona {
    pub name: String,
    pub handle: Option<String>,
    pub prompt: String,
    pub tone: String,
    pub proactivity: f32,
    pub memory_window: Option<i32>,
    pub max_agents_per_turn: Option<i32>,
    pub is_default: bool,
    pub background: Option<String>,
    pub api_profile_id: Option<i64>,
}

impl NewPersona {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: None,
            prompt: String::new(),
            tone: "neutral".into(),
            proactivity: 0.5,
            memory_window: None,
            max_agents_per_turn: None,
            is_default: false,
            background: None,
            api_profile_id: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_proactivity(mut self, p: f32) -> Self {
        self.proactivity = p;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

/// Fields for creating an API profile.
#[derive(Debug, Clone)]
pub struct NewApiProfile {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub api_key: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<u32>,
}

/// Derive a handle from the display name when none was given.
pub(crate) fn normalize_handle(handle: Option<&str>, name: &str) -> String {
    match handle {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => name.trim().to_lowercase().replace(' ', "_"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_kind_from_sender() {
        assert_eq!(SenderKind::from_sender("user"), SenderKind::User);
        assert_eq!(SenderKind::from_sender("Ada"), SenderKind::Agent);
    }

    #[test]
    fn normalize_handle_prefers_explicit() {
        assert_eq!(normalize_handle(Some("ada"), "Ada Lovelace"), "ada");
    }

    #[test]
    fn normalize_handle_derives_from_name() {
        assert_eq!(normalize_handle(None, "Ada Lovelace"), "ada_lovelace");
        assert_eq!(normalize_handle(Some(""), " Ben "), "ben");
    }
}
