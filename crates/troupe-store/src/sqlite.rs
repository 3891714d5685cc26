// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SQLite-backed repositories.
//!
//! One connection guarded by an async mutex; statements are short and run
//! inline on the runtime.  Opened with WAL and a busy timeout; the schema
//! is applied on open with `CREATE TABLE IF NOT EXISTS` migrations.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crypto::KeyCipher;
use crate::models::{
    normalize_handle, ApiProfileRecord, MessageRecord, NewApiProfile, NewPersona, NewSession,
    PersonaApiConfig, PersonaRecord, PersonaSettings, SenderKind, SessionPatch, SessionRecord,
};
use crate::repository::{PersonaRepository, SessionRepository};
use crate::{Result, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS api_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    model TEXT NOT NULL,
    temperature REAL,
    api_key_cipher TEXT,
    embedding_model TEXT,
    embedding_dimension INTEGER,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS personas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    handle TEXT NOT NULL,
    prompt TEXT NOT NULL DEFAULT '',
    tone TEXT NOT NULL DEFAULT 'neutral',
    proactivity REAL NOT NULL DEFAULT 0.5,
    memory_window INTEGER NOT NULL DEFAULT 8,
    max_agents_per_turn INTEGER NOT NULL DEFAULT 2,
    is_default INTEGER NOT NULL DEFAULT 0,
    background TEXT,
    api_profile_id INTEGER REFERENCES api_profiles(id) ON DELETE SET NULL,
    UNIQUE(user_id, handle)
);
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    title TEXT,
    user_display_name TEXT,
    user_handle TEXT,
    user_persona TEXT
);
CREATE TABLE IF NOT EXISTS session_participants (
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    persona_id INTEGER NOT NULL REFERENCES personas(id) ON DELETE CASCADE,
    PRIMARY KEY (session_id, persona_id)
);
CREATE TABLE IF NOT EXISTS session_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    sender_type TEXT NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_messages_session
    ON session_messages(session_id);
";

/// SQLite store implementing both repository traits.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    cipher: KeyCipher,
    default_memory_window: i32,
    default_max_agents: i32,
}

impl SqliteStore {
    /// Open from a `DATABASE_URL` (`sqlite:///path`, `sqlite::memory:` or a
    /// bare path), enable WAL, apply migrations.
    pub fn open(
        database_url: &str,
        cipher: KeyCipher,
        default_memory_window: i32,
        default_max_agents: i32,
    ) -> Result<Self> {
        let path = strip_sqlite_scheme(database_url);
        let conn = if path == ":memory:" {
            Connection::open_in_memory().context("open in-memory database")?
        } else {
            Connection::open(path).with_context(|| format!("open database {path}"))?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")
            .context("set pragmas")?;
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cipher,
            default_memory_window,
            default_max_agents,
        })
    }

    fn get_or_create_user(conn: &Connection, username: &str) -> Result<i64> {
        conn.execute("INSERT OR IGNORE INTO users (username) VALUES (?1)", params![username])?;
        let id = conn.query_row(
            "SELECT id FROM users WHERE username = ?1",
            params![username],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    fn get_user(conn: &Connection, username: &str) -> Result<Option<i64>> {
        Ok(conn
            .query_row("SELECT id FROM users WHERE username = ?1", params![username], |r| {
                r.get(0)
            })
            .optional()?)
    }

    fn persona_from_row(row: &Row<'_>, username: String) -> rusqlite::Result<PersonaRecord> {
        Ok(PersonaRecord {
            id: row.get("id")?,
            username,
            name: row.get("name")?,
            handle: row.get("handle")?,
            prompt: row.get("prompt")?,
            tone: row.get("tone")?,
            proactivity: row.get::<_, f64>("proactivity")? as f32,
            memory_window: row.get("memory_window")?,
            max_agents_per_turn: row.get("max_agents_per_turn")?,
            is_default: row.get::<_, i64>("is_default")? != 0,
            background: row.get("background")?,
            api_profile_id: row.get("api_profile_id")?,
            api: None,
        })
    }

    fn load_participants(conn: &Connection, session_id: &str) -> Result<Vec<PersonaRecord>> {
        let mut stmt = conn.prepare(
            "SELECT p.id, p.name, p.handle, p.prompt, p.tone, p.proactivity,
                    p.memory_window, p.max_agents_per_turn, p.is_default,
                    p.background, p.api_profile_id, u.username
             FROM personas p
             JOIN session_participants sp ON sp.persona_id = p.id
             JOIN users u ON u.id = p.user_id
             WHERE sp.session_id = ?1
             ORDER BY p.id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let username: String = row.get("username")?;
            Self::persona_from_row(row, username)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn load_session(conn: &Connection, session_id: &str) -> Result<Option<SessionRecord>> {
        let base = conn
            .query_row(
                "SELECT s.id, u.username, s.created_at, s.title,
                        s.user_display_name, s.user_handle, s.user_persona
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: parse_ts(row.get::<_, String>(2)?),
                        title: row.get(3)?,
                        user_display_name: row.get(4)?,
                        user_handle: row.get(5)?,
                        user_persona: row.get(6)?,
                        participants: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut record) = base else {
            return Ok(None);
        };
        record.participants = Self::load_participants(conn, session_id)?;
        Ok(Some(record))
    }

    fn require_session(conn: &Connection, session_id: &str) -> Result<SessionRecord> {
        Self::load_session(conn, session_id)?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }
}

fn strip_sqlite_scheme(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl SessionRepository for SqliteStore {
    async fn create(&self, username: &str, new: NewSession) -> Result<SessionRecord> {
        let conn = self.conn.lock().await;
        let user_id = Self::get_or_create_user(&conn, username)?;
        let id = format!("sess-{}", Uuid::new_v4());
        conn.execute(
            "INSERT INTO sessions (id, user_id, created_at, title, user_display_name, user_handle, user_persona)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                user_id,
                Utc::now().to_rfc3339(),
                new.title,
                new.user_display_name,
                new.user_handle,
                new.user_persona
            ],
        )?;
        for pid in &new.initial_persona_ids {
            conn.execute(
                "INSERT OR IGNORE INTO session_participants (session_id, persona_id)
                 SELECT ?1, id FROM personas WHERE id = ?2 AND user_id = ?3",
                params![id, pid, user_id],
            )?;
        }
        Self::require_session(&conn, &id)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock().await;
        Self::load_session(&conn, session_id)
    }

    async fn list_sessions(&self, username: &str) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock().await;
        let Some(user_id) = Self::get_user(&conn, username)? else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![user_id], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = Self::load_session(&conn, &id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn add_message(
        &self,
        session_id: &str,
        sender: &str,
        content: &str,
    ) -> Result<MessageRecord> {
        let conn = self.conn.lock().await;
        Self::require_session(&conn, session_id)?;
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            sender_kind: SenderKind::from_sender(sender),
            sender: sender.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO session_messages (id, session_id, sender_type, sender, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.session_id,
                record.sender_kind.as_str(),
                record.sender,
                record.content,
                record.created_at.to_rfc3339()
            ],
        )?;
        Ok(record)
    }

    async fn list_messages(&self, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock().await;
        Self::require_session(&conn, session_id)?;
        // rowid order is insertion order; take the most recent `limit`, then
        // restore chronological order.
        let mut stmt = conn.prepare(
            "SELECT id, session_id, sender_type, sender, content, created_at
             FROM session_messages WHERE session_id = ?1
             ORDER BY rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok(MessageRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                sender_kind: SenderKind::parse(&row.get::<_, String>(2)?),
                sender: row.get(3)?,
                content: row.get(4)?,
                created_at: parse_ts(row.get::<_, String>(5)?),
            })
        })?;
        let mut out: Vec<MessageRecord> = rows.collect::<rusqlite::Result<_>>()?;
        out.reverse();
        Ok(out)
    }

    async fn update_user_persona(
        &self,
        session_id: &str,
        user_persona: Option<String>,
    ) -> Result<SessionRecord> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE sessions SET user_persona = ?2 WHERE id = ?1",
            params![session_id, user_persona],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Self::require_session(&conn, session_id)
    }

    async fn update_participants(
        &self,
        session_id: &str,
        persona_ids: &[i64],
    ) -> Result<SessionRecord> {
        let conn = self.conn.lock().await;
        let record = Self::require_session(&conn, session_id)?;
        let user_id = Self::get_user(&conn, &record.username)?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        conn.execute(
            "DELETE FROM session_participants WHERE session_id = ?1",
            params![session_id],
        )?;
        for pid in persona_ids {
            conn.execute(
                "INSERT OR IGNORE INTO session_participants (session_id, persona_id)
                 SELECT ?1, id FROM personas WHERE id = ?2 AND user_id = ?3",
                params![session_id, pid, user_id],
            )?;
        }
        Self::require_session(&conn, session_id)
    }

    async fn update_metadata(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<SessionRecord> {
        let conn = self.conn.lock().await;
        Self::require_session(&conn, session_id)?;
        if let Some(title) = patch.title {
            conn.execute("UPDATE sessions SET title = ?2 WHERE id = ?1", params![session_id, title])?;
        }
        if let Some(name) = patch.user_display_name {
            conn.execute(
                "UPDATE sessions SET user_display_name = ?2 WHERE id = ?1",
                params![session_id, name],
            )?;
        }
        if let Some(handle) = patch.user_handle {
            conn.execute(
                "UPDATE sessions SET user_handle = ?2 WHERE id = ?1",
                params![session_id, handle],
            )?;
        }
        if let Some(persona) = patch.user_persona {
            conn.execute(
                "UPDATE sessions SET user_persona = ?2 WHERE id = ?1",
                params![session_id, persona],
            )?;
        }
        Self::require_session(&conn, session_id)
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn delete_sessions(&self, session_ids: &[String]) -> Result<()> {
        let conn = self.conn.lock().await;
        for id in session_ids {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        }
        Ok(())
    }
}

#[async_trait]
impl PersonaRepository for SqliteStore {
    async fn create_profile(&self, username: &str, new: NewApiProfile) -> Result<ApiProfileRecord> {
        let conn = self.conn.lock().await;
        let user_id = Self::get_or_create_user(&conn, username)?;
        let created_at = Utc::now();
        let cipher_text = new.api_key.as_deref().map(|k| self.cipher.encrypt(k));
        conn.execute(
            "INSERT INTO api_profiles
             (user_id, name, base_url, model, temperature, api_key_cipher,
              embedding_model, embedding_dimension, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user_id,
                new.name,
                new.base_url,
                new.model,
                new.temperature,
                cipher_text,
                new.embedding_model,
                new.embedding_dimension,
                created_at.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(ApiProfileRecord {
            id,
            username: username.to_string(),
            name: new.name,
            base_url: new.base_url,
            model: new.model,
            temperature: new.temperature,
            embedding_model: new.embedding_model,
            embedding_dimension: new.embedding_dimension,
            created_at,
            api_key_preview: new.api_key.as_deref().and_then(KeyCipher::mask),
        })
    }

    async fn list_profiles(&self, username: &str) -> Result<Vec<ApiProfileRecord>> {
        let conn = self.conn.lock().await;
        let Some(user_id) = Self::get_user(&conn, username)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, model, temperature, api_key_cipher,
                    embedding_model, embedding_dimension, created_at
             FROM api_profiles WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<u32>>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (id, name, base_url, model, temperature, cipher_text, emb_model, emb_dim, created) = r?;
            let decrypted = cipher_text.as_deref().map(|c| self.cipher.decrypt(c));
            out.push(ApiProfileRecord {
                id,
                username: username.to_string(),
                name,
                base_url,
                model,
                temperature: temperature.map(|t| t as f32),
                embedding_model: emb_model,
                embedding_dimension: emb_dim,
                created_at: parse_ts(created),
                api_key_preview: decrypted.as_deref().and_then(KeyCipher::mask),
            });
        }
        Ok(out)
    }

    async fn get_profile(
        &self,
        username: &str,
        profile_id: i64,
    ) -> Result<Option<ApiProfileRecord>> {
        Ok(self
            .list_profiles(username)
            .await?
            .into_iter()
            .find(|p| p.id == profile_id))
    }

    async fn delete_profile(&self, username: &str, profile_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let Some(user_id) = Self::get_user(&conn, username)? else {
            return Err(StoreError::ProfileNotFound(profile_id));
        };
        let changed = conn.execute(
            "DELETE FROM api_profiles WHERE id = ?1 AND user_id = ?2",
            params![profile_id, user_id],
        )?;
        if changed == 0 {
            return Err(StoreError::ProfileNotFound(profile_id));
        }
        Ok(())
    }

    async fn create_persona(&self, username: &str, new: NewPersona) -> Result<PersonaRecord> {
        let conn = self.conn.lock().await;
        let user_id = Self::get_or_create_user(&conn, username)?;
        let handle = normalize_handle(new.handle.as_deref(), &new.name);
        conn.execute(
            "INSERT INTO personas
             (user_id, name, handle, prompt, tone, proactivity, memory_window,
              max_agents_per_turn, is_default, background, api_profile_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                user_id,
                new.name,
                handle,
                new.prompt,
                new.tone,
                new.proactivity as f64,
                new.memory_window.unwrap_or(self.default_memory_window),
                new.max_agents_per_turn.unwrap_or(self.default_max_agents),
                new.is_default as i64,
                new.background,
                new.api_profile_id
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(PersonaRecord {
            id,
            username: username.to_string(),
            name: new.name,
            handle,
            prompt: new.prompt,
            tone: new.tone,
            proactivity: new.proactivity,
            memory_window: new.memory_window.unwrap_or(self.default_memory_window),
            max_agents_per_turn: new.max_agents_per_turn.unwrap_or(self.default_max_agents),
            is_default: new.is_default,
            background: new.background,
            api_profile_id: new.api_profile_id,
            api: None,
        })
    }

    async fn list_personas(&self, username: &str) -> Result<Vec<PersonaRecord>> {
        let conn = self.conn.lock().await;
        let Some(user_id) = Self::get_user(&conn, username)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT id, name, handle, prompt, tone, proactivity, memory_window,
                    max_agents_per_turn, is_default, background, api_profile_id
             FROM personas WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Self::persona_from_row(row, username.to_string())
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    async fn get_persona(&self, username: &str, persona_id: i64) -> Result<Option<PersonaRecord>> {
        Ok(self
            .list_personas(username)
            .await?
            .into_iter()
            .find(|p| p.id == persona_id))
    }

    async fn delete_persona(&self, username: &str, persona_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let Some(user_id) = Self::get_user(&conn, username)? else {
            return Err(StoreError::PersonaNotFound(persona_id));
        };
        let changed = conn.execute(
            "DELETE FROM personas WHERE id = ?1 AND user_id = ?2",
            params![persona_id, user_id],
        )?;
        if changed == 0 {
            return Err(StoreError::PersonaNotFound(persona_id));
        }
        Ok(())
    }

    async fn load_persona_settings(&self, username: &str) -> Result<PersonaSettings> {
        let mut personas = self.list_personas(username).await?;
        let profiles = {
            let conn = self.conn.lock().await;
            let Some(user_id) = Self::get_user(&conn, username)? else {
                return Ok(PersonaSettings {
                    personas: Vec::new(),
                    max_agents_per_turn: self.default_max_agents,
                    memory_window: self.default_memory_window,
                });
            };
            let mut stmt = conn.prepare(
                "SELECT id, model, base_url, temperature, api_key_cipher
                 FROM api_profiles WHERE user_id = ?1",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for p in &mut personas {
            if let Some(profile_id) = p.api_profile_id {
                if let Some((_, model, base_url, temperature, cipher_text)) =
                    profiles.iter().find(|(id, ..)| *id == profile_id)
                {
                    let key = cipher_text.as_deref().map(|c| self.cipher.decrypt(c));
                    p.api = Some(PersonaApiConfig {
                        model: Some(model.clone()),
                        base_url: Some(base_url.clone()),
                        api_key: key.filter(|k| !k.is_empty()),
                        temperature: temperature.map(|t| t as f32),
                    });
                }
            }
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

// ─── Unit tests ──────────────────────────────────────────────────────────────
