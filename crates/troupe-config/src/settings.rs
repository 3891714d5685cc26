// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::{bail, Result};

/// Which session repository backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionRepoKind {
    #[default]
    Db,
    Memory,
}

/// Which runtime adapter drives persona turns.
///
/// `Stub` echoes the inbound message back from the first target persona and
/// exists so API-level tests can run without any LLM endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    #[default]
    Engine,
    Stub,
}

/// Application-level configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,

    // Runtime defaults; per-user data in the store overrides these.
    pub max_agents_per_turn: i32,
    pub memory_window: i32,
    pub temperature: f32,
    /// Max conversation rounds per user message.
    pub max_exchanges_per_turn: u32,

    // Smart stop policy.
    pub stop_patience: usize,
    pub stop_heat_threshold: f32,
    pub stop_similarity_threshold: f32,

    /// Most recent stored messages attached as history before enqueueing.
    pub history_limit: usize,

    /// Secret the API-key cipher is derived from.  Empty disables encryption
    /// (keys are stored verbatim, still masked in listings).
    pub encryption_key: String,

    // Process-level default LLM profile, used by personas without their own.
    pub default_base_url: String,
    pub default_model: String,
    pub default_api_key: String,

    // Process-level embedding profile for the retrieval service.
    pub embedding_model: String,
    pub embedding_dimension: usize,

    /// HTTP/WebSocket bind address.
    pub listen_addr: String,

    pub session_repo: SessionRepoKind,
    pub runtime_mode: RuntimeMode,
}

impl Settings {
    /// Load settings from the environment, reading `.env` first when present.
    ///
    /// `DATABASE_URL` is required unless the in-memory session repository is
    /// selected.  Malformed numeric values fall back to the documented
    /// defaults rather than failing startup.
    pub fn from_env() -> Result<Self> {
        // Existing process variables take precedence over the file.
        let _ = dotenvy::dotenv();

        let session_repo = match env("MUL_IN_ONE_SESSION_REPO").as_deref() {
            Some("memory") => SessionRepoKind::Memory,
            _ => SessionRepoKind::Db,
        };

        let database_url = match env("DATABASE_URL") {
            Some(url) => url,
            None if session_repo == SessionRepoKind::Memory => String::new(),
            None => bail!("missing required environment variable: DATABASE_URL"),
        };

        let runtime_mode = match env("MUL_IN_ONE_RUNTIME_MODE").as_deref() {
            Some("stub") => RuntimeMode::Stub,
            _ => RuntimeMode::Engine,
        };

        Ok(Self {
            database_url,
            max_agents_per_turn: env_parse("MUL_IN_ONE_MAX_AGENTS", 2),
            memory_window: env_parse("MUL_IN_ONE_MEMORY_WINDOW", 8),
            temperature: env_parse("MUL_IN_ONE_TEMPERATURE", 0.4),
            max_exchanges_per_turn: env_parse("MUL_IN_ONE_MAX_EXCHANGES", 8u32).max(1),
            stop_patience: env_parse("MUL_IN_ONE_STOP_PATIENCE", 2usize),
            stop_heat_threshold: env_parse("MUL_IN_ONE_STOP_HEAT_THRESH", 0.6),
            stop_similarity_threshold: env_parse("MUL_IN_ONE_STOP_SIM_THRESH", 0.9),
            history_limit: env_parse("MUL_IN_ONE_HISTORY_LIMIT", 50usize),
            encryption_key: env("MUL_IN_ONE_ENCRYPTION_KEY").unwrap_or_default(),
            default_base_url: env("MUL_IN_ONE_DEFAULT_BASE_URL").unwrap_or_default(),
            default_model: env("MUL_IN_ONE_DEFAULT_MODEL").unwrap_or_default(),
            default_api_key: env("MUL_IN_ONE_DEFAULT_API_KEY").unwrap_or_default(),
            embedding_model: env("MUL_IN_ONE_EMBEDDING_MODEL").unwrap_or_default(),
            embedding_dimension: env_parse("MUL_IN_ONE_EMBEDDING_DIMENSION", 1024usize),
            listen_addr: env("MUL_IN_ONE_LISTEN").unwrap_or_else(|| "0.0.0.0:8021".to_string()),
            session_repo,
            runtime_mode,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_agents_per_turn: 2,
            memory_window: 8,
            temperature: 0.4,
            max_exchanges_per_turn: 8,
            stop_patience: 2,
            stop_heat_threshold: 0.6,
            stop_similarity_threshold: 0.9,
            history_limit: 50,
            encryption_key: String::new(),
            default_base_url: String::new(),
            default_model: String::new(),
            default_api_key: String::new(),
            embedding_model: String::new(),
            embedding_dimension: 1024,
            listen_addr: "0.0.0.0:8021".to_string(),
            session_repo: SessionRepoKind::Memory,
            runtime_mode: RuntimeMode::Engine,
        }
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "unparseable value, using default");
            default
        }),
        None => default,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
