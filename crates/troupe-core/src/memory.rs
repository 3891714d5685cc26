// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};

/// One remembered utterance.  `recipient` is `None` for group messages.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub speaker: String,
    pub content: String,
    pub recipient: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only conversation memory for one turn.
///
/// Rebuilt from stored history at the start of every user turn and extended
/// with each reply as the rounds progress.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    entries: Vec<MemoryEntry>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        speaker: impl Into<String>,
        content: impl Into<String>,
        recipient: Option<String>,
    ) {
        self.entries.push(MemoryEntry {
            speaker: speaker.into(),
            content: content.into(),
            recipient,
            timestamp: Utc::now(),
        });
    }

    /// The last `n` entries; `n <= 0` means the full history.
    pub fn recent(&self, n: i64) -> &[MemoryEntry] {
        let len = self.entries.len();
        let effective = if n <= 0 { len } else { (n as usize).min(len) };
        &self.entries[len - effective..]
    }

    /// Window used for prompt assembly: `last_n` overrides the default
    /// `window` when given.
    pub fn window(&self, window: i64, last_n: Option<i64>) -> &[MemoryEntry] {
        match last_n {
            Some(n) => self.recent(n),
            None => self.recent(window),
        }
    }

    /// Content of the newest entry, or `""` when empty.
    pub fn last_message(&self) -> &str {
        self.entries.last().map(|e| e.content.as_str()).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> ConversationMemory {
        let mut m = ConversationMemory::new();
        m.add("user", "one", None);
        m.add("Ada", "two", None);
        m.add("Ben", "three", Some("Ada".into()));
        m
    }

    #[test]
    fn recent_returns_last_n() {
        let m = seeded();
        let r = m.recent(2);
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].content, "two");
        assert_eq!(r[1].content, "three");
    }

    #[test]
    fn recent_zero_means_full_history() {
        let m = seeded();
        assert_eq!(m.recent(0).len(), 3);
    }

    #[test]
    fn recent_negative_means_full_history() {
        let m = seeded();
        assert_eq!(m.recent(-1).len(), 3);
    }

    #[test]
    fn recent_larger_than_len_is_clamped() {
        let m = seeded();
        assert_eq!(m.recent(99).len(), 3);
    }

    #[test]
    fn window_last_n_overrides_default() {
        let m = seeded();
        assert_eq!(m.window(8, Some(1)).len(), 1);
        assert_eq!(m.window(2, None).len(), 2);
    }

    #[test]
    fn last_message_of_empty_memory_is_empty() {
        let m = ConversationMemory::new();
        assert_eq!(m.last_message(), "");
    }

    #[test]
    fn recipient_is_preserved() {
        let m = seeded();
        assert_eq!(m.recent(1)[0].recipient.as_deref(), Some("Ada"));
    }
}
