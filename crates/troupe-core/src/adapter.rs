// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime adapters bridge the session worker to turn execution.
//!
//! The engine adapter drives the real conversation loop; the stub echoes
//! the inbound message and exists so API-level tests can run without any
//! model endpoint (`MUL_IN_ONE_RUNTIME_MODE=stub`).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

use troupe_config::Settings;
use troupe_retrieval::RetrievalScope;
use troupe_store::{SessionMessage, SessionRecord};

use crate::dialogue::{run_turn, TurnContext};
use crate::events::SessionStreamEvent;
use crate::interrupts::InterruptRegistry;
use crate::runtime::UserRuntimes;

/// Executes one queued message and streams events back to the worker.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn invoke_stream(
        &self,
        session: SessionRecord,
        message: SessionMessage,
    ) -> mpsc::Receiver<SessionStreamEvent>;
}

/// Echo adapter for tests and local development.
pub struct StubRuntimeAdapter;

#[async_trait]
impl RuntimeAdapter for StubRuntimeAdapter {
    async fn invoke_stream(
        &self,
        _session: SessionRecord,
        message: SessionMessage,
    ) -> mpsc::Receiver<SessionStreamEvent> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let sender = message
                .target_personas
                .as_ref()
                .and_then(|t| t.first().cloned())
                .unwrap_or_else(|| "assistant".to_string());
            let from = if message.sender.is_empty() { "user" } else { &message.sender };
            let content = format!("{from}:{}", message.content);
            let _ = tx.send(SessionStreamEvent::agent_start(&sender)).await;
            let _ = tx.send(SessionStreamEvent::agent_chunk(&sender, &content)).await;
            let _ = tx.send(SessionStreamEvent::agent_end(&sender, &content)).await;
        });
        rx
    }
}

/// The real adapter: per-user runtime cache plus the conversation loop.
pub struct EngineRuntimeAdapter {
    runtimes: Arc<UserRuntimes>,
    settings: Settings,
    interrupts: InterruptRegistry,
    scope: RetrievalScope,
    scheduler_seed: Option<u64>,
}

impl EngineRuntimeAdapter {
    pub fn new(
        runtimes: Arc<UserRuntimes>,
        settings: Settings,
        interrupts: InterruptRegistry,
        scope: RetrievalScope,
    ) -> Self {
        Self { runtimes, settings, interrupts, scope, scheduler_seed: None }
    }

    /// Fix the scheduler seed so tests can assert exact speaker selections.
    pub fn with_scheduler_seed(mut self, seed: u64) -> Self {
        self.scheduler_seed = Some(seed);
        self
    }
}

#[async_trait]
impl RuntimeAdapter for EngineRuntimeAdapter {
    async fn invoke_stream(
        &self,
        session: SessionRecord,
        message: SessionMessage,
    ) -> mpsc::Receiver<SessionStreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let runtimes = self.runtimes.clone();
        let settings = self.settings.clone();
        let interrupts = self.interrupts.clone();
        let scope = self.scope.clone();
        let seed = self.scheduler_seed;
        tokio::spawn(async move {
            let runtime = match runtimes.get_or_build(&session.username).await {
                Ok(rt) => rt,
                Err(e) => {
                    error!(user = %session.username, "failed to build runtime: {e:#}");
                    return;
                }
            };
            let ctx = TurnContext {
                session,
                message,
                runtime,
                settings,
                interrupts,
                scope,
                scheduler_seed: seed,
            };
            run_turn(ctx, tx).await;
        });
        rx
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_store::HistoryEntry;

    fn record() -> SessionRecord {
        SessionRecord {
            id: "sess-1".into(),
            username: "alice".into(),
            created_at: chrono::Utc::now(),
            title: None,
            user_display_name: None,
            user_handle: None,
            user_persona: None,
            participants: vec![],
        }
    }

    #[tokio::test]
    async fn stub_emits_start_chunk_end_from_first_target() {
        let adapter = StubRuntimeAdapter;
        let mut message = SessionMessage::new("sess-1", "user", "hello");
        message.target_personas = Some(vec!["ada".into(), "ben".into()]);
        message.history = Some(vec![HistoryEntry { sender: "user".into(), content: "hello".into() }]);

        let mut rx = adapter.invoke_stream(record(), message).await;
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, "agent.start");
        assert_eq!(events[0].data_str("sender"), Some("ada"));
        assert_eq!(events[1].event, "agent.chunk");
        assert_eq!(events[1].data_str("content"), Some("user:hello"));
        assert_eq!(events[2].event, "agent.end");
    }

    #[tokio::test]
    async fn stub_defaults_to_assistant_without_targets() {
        let adapter = StubRuntimeAdapter;
        let message = SessionMessage::new("sess-1", "user", "hi");
        let mut rx = adapter.invoke_stream(record(), message).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.data_str("sender"), Some("assistant"));
    }
}
