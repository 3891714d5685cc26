// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// Structured event emitted to session subscribers.
///
/// Event types are fixed: `agent.start`, `agent.chunk`, `agent.end`,
/// `session.stopped`, `session.interrupted`.  The conversation loop emits
/// lean events (sender + content); the session worker enriches them with
/// `message_id`, `session_id` and timestamps before fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStreamEvent {
    pub event: String,
    pub data: Value,
}

impl SessionStreamEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data }
    }

    pub fn agent_start(sender: &str) -> Self {
        Self::new("agent.start", json!({ "sender": sender }))
    }

    pub fn agent_chunk(sender: &str, content: &str) -> Self {
        Self::new("agent.chunk", json!({ "sender": sender, "content": content }))
    }

    pub fn agent_end(sender: &str, content: &str) -> Self {
        Self::new("agent.end", json!({ "sender": sender, "content": content }))
    }

    pub fn session_stopped(session_id: &str, reason: &str) -> Self {
        Self::new(
            "session.stopped",
            json!({ "session_id": session_id, "reason": reason, "timestamp": now_iso() }),
        )
    }

    pub fn session_interrupted(session_id: &str, reason: &str) -> Self {
        Self::new(
            "session.interrupted",
            json!({ "session_id": session_id, "reason": reason }),
        )
    }

    /// Read a string field from `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Insert `key` only when it is not already present.
    pub(crate) fn set_default(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.data {
            map.entry(key.to_string()).or_insert(value);
        }
    }

    pub(crate) fn set(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.data {
            map.insert(key.to_string(), value);
        }
    }
}

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_chunk_carries_sender_and_content() {
        let ev = SessionStreamEvent::agent_chunk("Ada", "hi");
        assert_eq!(ev.event, "agent.chunk");
        assert_eq!(ev.data_str("sender"), Some("Ada"));
        assert_eq!(ev.data_str("content"), Some("hi"));
    }

    #[test]
    fn session_stopped_has_timestamp() {
        let ev = SessionStreamEvent::session_stopped("s1", "force_stop");
        assert_eq!(ev.data_str("session_id"), Some("s1"));
        assert_eq!(ev.data_str("reason"), Some("force_stop"));
        assert!(ev.data_str("timestamp").is_some());
    }

    #[test]
    fn set_default_does_not_overwrite() {
        let mut ev = SessionStreamEvent::agent_start("Ada");
        ev.set_default("sender", json!("Other"));
        assert_eq!(ev.data_str("sender"), Some("Ada"));
        ev.set_default("message_id", json!("m1"));
        assert_eq!(ev.data_str("message_id"), Some("m1"));
    }

    #[test]
    fn serializes_as_event_and_data() {
        let ev = SessionStreamEvent::agent_end("Ada", "bye");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""event":"agent.end""#));
        assert!(json.contains(r#""data""#));
    }
}
