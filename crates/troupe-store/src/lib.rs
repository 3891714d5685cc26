// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistence layer: sessions, messages, personas and API credential
//! profiles behind async repository traits, with an in-memory and a SQLite
//! implementation of each.

mod crypto;
mod error;
mod memory;
mod models;
mod repository;
mod sqlite;

pub use crypto::KeyCipher;
pub use error::{Result, StoreError};
pub use memory::{InMemoryPersonaRepository, InMemorySessionRepository};
pub use models::{
    ApiProfileRecord, HistoryEntry, MessageRecord, NewApiProfile, NewPersona, NewSession,
    PersonaApiConfig, PersonaRecord, PersonaSettings, SenderKind, SessionMessage, SessionPatch,
    SessionRecord,
};
pub use repository::{PersonaRepository, SessionRepository};
pub use sqlite::SqliteStore;
