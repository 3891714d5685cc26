// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The conversation loop: one user turn, possibly many rounds.
//!
//! Each round asks the scheduler for speakers, streams every selected
//! persona through its invoker and evaluates the stop rules.  Events leave
//! through a channel; the session worker enriches them with message ids
//! and persistence before fan-out.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use troupe_config::Settings;
use troupe_retrieval::RetrievalScope;
use troupe_store::{PersonaRecord, SessionMessage, SessionRecord};

use crate::events::SessionStreamEvent;
use crate::interrupts::InterruptRegistry;
use crate::invoker::{HistoryItem, InvokePayload};
use crate::memory::ConversationMemory;
use crate::runtime::UserRuntime;
use crate::scheduler::{PersonaState, TurnScheduler};
use crate::stop::{is_closing_phrase, is_soft_closing, StopPolicy};
use crate::text::{extract_tags, filter_special_tokens};

pub(crate) struct TurnContext {
    pub session: SessionRecord,
    pub message: SessionMessage,
    pub runtime: std::sync::Arc<UserRuntime>,
    pub settings: Settings,
    pub interrupts: InterruptRegistry,
    pub scope: RetrievalScope,
    /// Seeded scheduler randomness for deterministic tests.
    pub scheduler_seed: Option<u64>,
}

/// Drive one user turn to completion, emitting events into `tx`.
pub(crate) async fn run_turn(ctx: TurnContext, tx: mpsc::Sender<SessionStreamEvent>) {
    let scope = ctx.scope.clone();
    drive(ctx, tx).await;
    // The scope must not outlive the turn it was set for.
    scope.clear();
}

async fn drive(ctx: TurnContext, tx: mpsc::Sender<SessionStreamEvent>) {
    let session = &ctx.session;
    let message = &ctx.message;
    let runtime = &ctx.runtime;

    // Participants, enriched with the runtime's credential-loaded records.
    let participants: Vec<PersonaRecord> = session
        .participants
        .iter()
        .map(|p| runtime.persona_by_id(p.id).cloned().unwrap_or_else(|| p.clone()))
        .collect();
    if participants.is_empty() {
        debug!(session = %session.id, "no participants; nothing to do");
        return;
    }

    let pairs: Vec<(String, String)> = participants
        .iter()
        .map(|p| (p.name.clone(), p.handle.clone()))
        .collect();

    let mut active_participants: Vec<String> =
        participants.iter().map(|p| p.handle.clone()).collect();
    if !active_participants.iter().any(|h| h == "user" || h == "用户") {
        active_participants.insert(0, "user".to_string());
    }

    // Memory for the whole turn: attached history plus the fresh message.
    let mut memory = ConversationMemory::new();
    if let Some(history) = &message.history {
        for entry in history {
            memory.add(&entry.sender, &entry.content, None);
        }
    }
    let user_sender = if message.sender.is_empty() { "user" } else { message.sender.as_str() };
    let already_last = memory.len() > 0 && {
        let last = memory.recent(1);
        last[0].speaker == user_sender && last[0].content == message.content
    };
    if !already_last {
        memory.add(user_sender, &message.content, None);
    }

    let max_agents = if runtime.max_agents_per_turn <= 0 {
        participants.len()
    } else {
        runtime.max_agents_per_turn as usize
    };
    let states: Vec<PersonaState> = participants
        .iter()
        .map(|p| PersonaState::new(&p.name, p.proactivity))
        .collect();
    let mut scheduler = match ctx.scheduler_seed {
        Some(seed) => TurnScheduler::with_seed(states, max_agents, seed),
        None => TurnScheduler::new(states, max_agents),
    };

    let mut context_tags = extract_tags(&message.content, &pairs);

    // Explicit targeting: the default hint names every participant, which
    // restricts nothing; a real subset restricts each round and ends the
    // turn once everyone in it has answered.
    let user_selected: Option<Vec<String>> = message.target_personas.as_ref().and_then(|handles| {
        let names: Vec<String> = handles
            .iter()
            .filter_map(|h| {
                participants
                    .iter()
                    .find(|p| &p.handle == h)
                    .map(|p| p.name.clone())
            })
            .collect();
        if names.is_empty() || names.len() == participants.len() {
            None
        } else {
            Some(names)
        }
    });
    if let Some(selected) = &user_selected {
        context_tags.retain(|t| selected.contains(t));
    }

    let soft_closing = is_soft_closing(&message.content);
    let max_exchanges = if soft_closing { 1 } else { ctx.settings.max_exchanges_per_turn };

    let mut stop_policy = StopPolicy::new(
        ctx.settings.stop_patience,
        ctx.settings.stop_heat_threshold,
        ctx.settings.stop_similarity_threshold,
        participants.len(),
        &context_tags,
    );

    let mut last_speaker = user_sender.to_string();
    let mut is_first_round = true;
    let mut responded: HashSet<String> = HashSet::new();

    info!(
        session = %session.id,
        participants = participants.len(),
        tags = ?context_tags,
        soft_closing,
        "starting conversation turn"
    );

    for exchange_round in 0..max_exchanges {
        let empty: Vec<String> = Vec::new();
        let tags: &[String] = if exchange_round == 0 {
            &context_tags
        } else if let Some(selected) = &user_selected {
            selected
        } else {
            &empty
        };

        let mut speakers = scheduler.next_turn(tags, Some(last_speaker.as_str()), is_first_round);
        if let Some(selected) = &user_selected {
            speakers.retain(|s| selected.contains(s));
        }
        debug!(session = %session.id, round = exchange_round, ?speakers, "scheduler decision");

        if speakers.is_empty() {
            break;
        }

        // A lone candidate equal to the last speaker would talk to itself;
        // skip the round and give the others another chance.
        if speakers.len() == 1 && speakers[0] == last_speaker && !is_first_round {
            continue;
        }

        let mut round_text_total = String::new();
        let mut round_speakers: Vec<String> = Vec::new();
        let mut closing_detected = false;

        for persona_name in speakers {
            let observed_turn =
                exchange_round > 0 && !soft_closing && responded.contains(&persona_name);
            if observed_turn && persona_name == last_speaker {
                continue;
            }

            let Some(persona) = participants.iter().find(|p| p.name == persona_name) else {
                continue;
            };
            let Some(invoker) = runtime.invoker(&persona_name) else {
                warn!(persona = %persona_name, "no invoker in runtime; skipping speaker");
                continue;
            };

            if !send(&tx, SessionStreamEvent::agent_start(&persona_name)).await {
                return;
            }
            round_speakers.push(persona_name.clone());

            // Make the speaker's collection reachable for rag_query.
            ctx.scope.set(&session.username, persona.id);

            let user_message = if observed_turn {
                format!(
                    "你刚刚观察到 \"{last_speaker}\" 说: \"{}\"。现在轮到你发言，你可以对此进行评论，或开启新话题。",
                    memory.last_message()
                )
            } else {
                message.content.clone()
            };

            // All but the newest entry: the newest is what the user turn
            // below frames.
            let entries = memory.recent(0);
            let history: Vec<HistoryItem> = entries[..entries.len().saturating_sub(1)]
                .iter()
                .map(|e| HistoryItem { speaker: e.speaker.clone(), content: e.content.clone() })
                .collect();

            let payload = InvokePayload {
                history,
                user_message,
                observed: observed_turn,
                active_participants: active_participants.clone(),
                user_display_name: session.user_display_name.clone(),
                user_handle: session.user_handle.clone(),
                user_persona: session.user_persona.clone(),
            };

            let mut full_reply = String::new();
            let mut rx = invoker.stream(payload);
            while let Some(chunk) = rx.recv().await {
                let filtered = filter_special_tokens(&chunk);
                if filtered.is_empty() {
                    continue;
                }
                if !send(&tx, SessionStreamEvent::agent_chunk(&persona_name, &filtered)).await {
                    return;
                }
                full_reply.push_str(&filtered);
            }

            if !send(&tx, SessionStreamEvent::agent_end(&persona_name, &full_reply)).await {
                return;
            }

            memory.add(&persona_name, &full_reply, None);
            last_speaker = persona_name.clone();
            responded.insert(persona_name.clone());
            round_text_total.push_str(&full_reply);

            let new_tags = extract_tags(&full_reply, &pairs);
            for tag in new_tags {
                context_tags.push(tag);
            }
            if context_tags.len() > 32 {
                let mut seen = HashSet::new();
                context_tags.retain(|t| seen.insert(t.clone()));
            }

            if is_closing_phrase(&full_reply) {
                closing_detected = true;
            }
        }

        if closing_detected {
            info!(session = %session.id, "closing phrase detected; stopping turn");
            let _ = send(
                &tx,
                SessionStreamEvent::session_stopped(&session.id, "closing_phrase"),
            )
            .await;
            return;
        }

        let round_mentions = extract_tags(&round_text_total, &pairs);
        let verdict = stop_policy.observe_round(&round_text_total, &round_speakers, &round_mentions);
        debug!(
            session = %session.id,
            round = exchange_round,
            heat = verdict.heat,
            similarity = verdict.similarity,
            "round complete"
        );
        if !soft_closing && verdict.should_stop {
            info!(session = %session.id, reason = ?verdict.reason, "smart-stop ended the turn");
            break;
        }

        if let Some(selected) = &user_selected {
            if selected.iter().all(|p| responded.contains(p)) {
                debug!(session = %session.id, "all targeted personas responded");
                break;
            }
        }

        if ctx.interrupts.consume(&session.id) {
            info!(session = %session.id, "interrupt consumed; yielding to pending user message");
            let _ = send(
                &tx,
                SessionStreamEvent::session_interrupted(&session.id, "user_message_pending"),
            )
            .await;
            break;
        }

        is_first_round = false;
    }
}

async fn send(tx: &mpsc::Sender<SessionStreamEvent>, event: SessionStreamEvent) -> bool {
    tx.send(event).await.is_ok()
}
