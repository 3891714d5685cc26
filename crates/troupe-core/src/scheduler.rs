// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Dynamic turn scheduler for multi-party dialogue.
//!
//! Each round every persona is scored by proactivity plus situational
//! bonuses and penalties, with a little noise so the conversation never
//! feels mechanical.  Personas named in `context_tags` are forced speakers
//! for the round.  The scheduler is pure bookkeeping (it never suspends)
//! and is rebuilt for every user message.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Per-persona, per-session scheduling state.
#[derive(Debug, Clone)]
pub struct PersonaState {
    pub name: String,
    /// 0.0–1.0, the persona's base willingness to speak.
    pub proactivity: f32,
    /// Rounds a persona sits out after speaking.
    pub cooldown: i32,
    pub last_turn: i32,
    pub consecutive_speaks: u32,
}

impl PersonaState {
    pub fn new(name: impl Into<String>, proactivity: f32) -> Self {
        Self {
            name: name.into(),
            proactivity,
            cooldown: 1,
            last_turn: -10,
            consecutive_speaks: 0,
        }
    }
}

/// Decides which personas speak each round.
pub struct TurnScheduler {
    /// Insertion order doubles as the persona-id tiebreak.
    personas: Vec<PersonaState>,
    max_agents: usize,
    turn: i32,
    silence_threshold: u32,
    silence_count: u32,
    rng: StdRng,
}

/// Sentinel score for personas that were explicitly mentioned.
const MENTION_SCORE: f32 = 100.0;

impl TurnScheduler {
    pub fn new(personas: Vec<PersonaState>, max_agents: usize) -> Self {
        Self::with_rng(personas, max_agents, StdRng::from_entropy())
    }

    /// Seeded construction for deterministic tests.
    pub fn with_seed(personas: Vec<PersonaState>, max_agents: usize, seed: u64) -> Self {
        Self::with_rng(personas, max_agents, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(personas: Vec<PersonaState>, max_agents: usize, rng: StdRng) -> Self {
        Self {
            personas,
            max_agents,
            turn: 0,
            silence_threshold: 2,
            silence_count: 0,
            rng,
        }
    }

    pub fn turn(&self) -> i32 {
        self.turn
    }

    pub fn state(&self, name: &str) -> Option<&PersonaState> {
        self.personas.iter().find(|p| p.name == name)
    }

    /// Decide who speaks this round.
    ///
    /// `context_tags` are persona names explicitly mentioned; they are
    /// forced speakers (unless they spoke this very turn) and are returned
    /// in mention order.  `is_user_message` is true on round 0 of a turn.
    pub fn next_turn(
        &mut self,
        context_tags: &[String],
        last_speaker: Option<&str>,
        is_user_message: bool,
    ) -> Vec<String> {
        let mut candidates: Vec<(String, f32)> = Vec::with_capacity(self.personas.len());

        for persona in &self.personas {
            let since_last = self.turn - persona.last_turn;

            // Mentioned personas must reply, unless they literally just spoke.
            if context_tags.contains(&persona.name) && since_last > 0 {
                candidates.push((persona.name.clone(), MENTION_SCORE));
                continue;
            }

            let mut score = persona.proactivity;

            // Cooldown: anyone who spoke within their cooldown sits out.
            if since_last <= persona.cooldown {
                continue;
            }

            // Monopoly penalty.
            if persona.consecutive_speaks >= 2 {
                score -= 0.3 * persona.consecutive_speaks as f32;
            }

            // Long silence earns a comeback bonus.
            if since_last > 5 {
                score += (since_last as f32 * 0.05).min(0.3);
            }

            // Responding to someone else keeps the thread going.
            if let Some(last) = last_speaker {
                if last != persona.name && since_last > 1 {
                    score += 0.15;
                }
            }

            // Eager personas jump on fresh user messages.
            if is_user_message && persona.proactivity > 0.6 {
                score += 0.2;
            }

            score += self.rng.gen_range(-0.1..=0.1);

            candidates.push((persona.name.clone(), score));
        }

        // Forced mentions take the whole round, in mention order.
        let mut mentioned: Vec<String> = candidates
            .iter()
            .filter(|(_, s)| *s >= MENTION_SCORE)
            .map(|(n, _)| n.clone())
            .collect();
        if !mentioned.is_empty() {
            mentioned.sort_by_key(|n| context_tags.iter().position(|t| t == n));
            for persona in &mut self.personas {
                if mentioned.contains(&persona.name) {
                    persona.last_turn = self.turn;
                    persona.consecutive_speaks += 1;
                } else {
                    persona.consecutive_speaks = 0;
                }
            }
            self.silence_count = 0;
            self.turn += 1;
            return mentioned;
        }

        // Stable sort keeps insertion order (persona id) on ties.
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let threshold = if self.silence_count >= self.silence_threshold {
            // The room has gone quiet; lower the bar.
            0.3
        } else {
            0.5
        };

        let mut chosen: Vec<String> = Vec::new();
        for (name, score) in &candidates {
            if *score >= threshold && chosen.len() < self.max_agents {
                if chosen.is_empty() && *score >= 0.4 {
                    chosen.push(name.clone());
                } else if !chosen.is_empty() && *score >= threshold + 0.1 * chosen.len() as f32 {
                    chosen.push(name.clone());
                }
            }
        }

        // A fresh user message always gets at least one responder.
        if chosen.is_empty() && is_user_message {
            if let Some((top, _)) = candidates.first() {
                chosen.push(top.clone());
            }
        }

        for persona in &mut self.personas {
            if chosen.contains(&persona.name) {
                persona.last_turn = self.turn;
                persona.consecutive_speaks += 1;
            } else {
                persona.consecutive_speaks = 0;
            }
        }

        if chosen.is_empty() {
            self.silence_count += 1;
        } else {
            self.silence_count = 0;
        }
        self.turn += 1;
        chosen
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
