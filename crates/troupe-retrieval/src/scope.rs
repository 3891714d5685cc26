// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Current retrieval tenant scope.
//!
//! The conversation loop sets `(user, persona_id)` before each persona
//! speaks and clears it when the turn ends; the rag tool reads it from
//! here.  The pair never travels through model-visible input, so a prompt
//! cannot inject another tenant's identifiers.

use std::sync::{Arc, RwLock};

/// Cloneable handle to the scope shared between the conversation loop and
/// the retrieval tool.
#[derive(Clone, Default)]
pub struct RetrievalScope {
    inner: Arc<RwLock<Option<(String, i64)>>>,
}

impl RetrievalScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scope for the persona about to speak.
    pub fn set(&self, user: impl Into<String>, persona_id: i64) {
        *self.inner.write().expect("scope lock poisoned") = Some((user.into(), persona_id));
    }

    /// Clear the scope (turn finished).
    pub fn clear(&self) {
        *self.inner.write().expect("scope lock poisoned") = None;
    }

    /// Read the current `(user, persona_id)`, if any.
    pub fn get(&self) -> Option<(String, i64)> {
        self.inner.read().expect("scope lock poisoned").clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
