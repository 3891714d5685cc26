// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session interrupt flags for user interjections.
//!
//! A lightweight, decoupled mechanism letting the conversation loop know
//! that a user message is pending so the current multi-round exchange cuts
//! short after the present round; the new message then starts within one
//! round of latency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide map from session id to a pending-interrupt flag.
#[derive(Clone, Default)]
pub struct InterruptRegistry {
    flags: Arc<Mutex<HashMap<String, bool>>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that an interrupt is requested for a session.
    pub fn request(&self, session_id: &str) {
        self.flags
            .lock()
            .expect("interrupt registry lock")
            .insert(session_id.to_string(), true);
    }

    /// Atomically read and clear the flag.  Returns true when an interrupt
    /// had been requested.
    pub fn consume(&self, session_id: &str) -> bool {
        self.flags
            .lock()
            .expect("interrupt registry lock")
            .remove(session_id)
            .unwrap_or(false)
    }

    /// Read without clearing.
    pub fn peek(&self, session_id: &str) -> bool {
        self.flags
            .lock()
            .expect("interrupt registry lock")
            .get(session_id)
            .copied()
            .unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
