// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Turn-ending heuristics.
//!
//! Three layers: phrase patterns (farewells in the user message soften the
//! turn to one round; farewells in a reply stop the session), the explicit
//! stop command, and the smart-stop policy that watches per-round "heat"
//! and inter-round redundancy.

use std::collections::{HashSet, VecDeque};
use std::sync::OnceLock;

use regex::Regex;

use crate::text::{cosine_similarity, tokenize_for_similarity};

fn soft_closing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(晚安|睡了|困了|先这样|明天见|good\s*night|sleep|该睡|不聊了)").unwrap()
    })
}

fn closing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(晚安|明天见|回头见|下次聊|到此为止|就到这|祝.*好梦|good\s*night|see\s*you)")
            .unwrap()
    })
}

fn explicit_stop_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:/stop|stop|结束|终止|强制停止|停止对话)\s*[。.!！]*\s*$").unwrap()
    })
}

/// A user farewell: the turn runs a single round.
pub fn is_soft_closing(text: &str) -> bool {
    soft_closing_re().is_match(text)
}

/// A farewell in an agent reply: the session stops with `closing_phrase`.
pub fn is_closing_phrase(text: &str) -> bool {
    closing_re().is_match(text)
}

/// An explicit stop command, matched against the whole message.
pub fn is_explicit_stop(text: &str) -> bool {
    explicit_stop_re().is_match(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Two consecutive rounds said essentially the same thing.
    Redundancy,
    /// Average heat over the patience window fell below threshold.
    LowHeat,
}

/// The verdict for one completed round.
#[derive(Debug, Clone)]
pub struct RoundVerdict {
    pub heat: f32,
    pub similarity: f32,
    pub should_stop: bool,
    pub reason: Option<StopReason>,
}

/// Sliding-window liveliness estimator for one turn.
pub struct StopPolicy {
    patience: usize,
    heat_threshold: f32,
    similarity_threshold: f32,
    num_participants: usize,
    heat_window: VecDeque<f32>,
    seen_speakers: HashSet<String>,
    seen_mentions: HashSet<String>,
    prev_round_vec: Option<std::collections::HashMap<String, u32>>,
    high_sim_streak: u32,
}

impl StopPolicy {
    pub fn new(
        patience: usize,
        heat_threshold: f32,
        similarity_threshold: f32,
        num_participants: usize,
        initial_mentions: &[String],
    ) -> Self {
        Self {
            patience: patience.max(1),
            heat_threshold,
            similarity_threshold,
            num_participants,
            heat_window: VecDeque::new(),
            seen_speakers: HashSet::new(),
            seen_mentions: initial_mentions.iter().cloned().collect(),
            prev_round_vec: None,
            high_sim_streak: 0,
        }
    }

    /// Score one completed round and decide whether the turn should stop.
    ///
    /// `heat = 0.6·min(len/80, 1) + 0.2·(new participants ratio)
    ///        + 0.2·has_question + min(0.2, 0.1·new mentions)`, clamped to
    /// [0, 1].  Stop on a redundancy streak of 2, or when the patience
    /// window is full and its average heat is below threshold.
    pub fn observe_round(
        &mut self,
        round_text: &str,
        round_speakers: &[String],
        round_mentions: &[String],
    ) -> RoundVerdict {
        let length_score = (round_text.chars().count() as f32 / 80.0).min(1.0);
        let new_participants = round_speakers
            .iter()
            .filter(|s| !self.seen_speakers.contains(*s))
            .count();
        let new_part_ratio = new_participants as f32 / self.num_participants.max(1) as f32;
        let has_question = round_text.contains('?') || round_text.contains('？');
        let new_mentions: Vec<&String> = round_mentions
            .iter()
            .filter(|m| !self.seen_mentions.contains(*m))
            .collect();
        let mention_bonus = (0.1 * new_mentions.len() as f32).min(0.2);

        let heat = (0.6 * length_score
            + 0.2 * new_part_ratio
            + if has_question { 0.2 } else { 0.0 }
            + mention_bonus)
            .clamp(0.0, 1.0);

        if self.heat_window.len() == self.patience {
            self.heat_window.pop_front();
        }
        self.heat_window.push_back(heat);
        self.seen_speakers.extend(round_speakers.iter().cloned());
        self.seen_mentions.extend(round_mentions.iter().cloned());

        let curr_vec = tokenize_for_similarity(round_text);
        let similarity = match &self.prev_round_vec {
            Some(prev) => cosine_similarity(prev, &curr_vec),
            None => 0.0,
        };
        if similarity >= self.similarity_threshold && !has_question && new_mentions.is_empty() {
            self.high_sim_streak += 1;
        } else {
            self.high_sim_streak = 0;
        }
        self.prev_round_vec = Some(curr_vec);

        let mut verdict = RoundVerdict { heat, similarity, should_stop: false, reason: None };
        if self.heat_window.len() >= self.patience {
            if self.high_sim_streak >= 2 {
                verdict.should_stop = true;
                verdict.reason = Some(StopReason::Redundancy);
            } else {
                let avg: f32 =
                    self.heat_window.iter().sum::<f32>() / self.heat_window.len() as f32;
                if avg < self.heat_threshold {
                    verdict.should_stop = true;
                    verdict.reason = Some(StopReason::LowHeat);
                }
            }
        }
        verdict
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Patterns ──────────────────────────────────────────────────────────────

    #[test]
    fn soft_closing_matches_farewells() {
        assert!(is_soft_closing("晚安大家"));
        assert!(is_soft_closing("我先睡了"));
        assert!(is_soft_closing("Good night everyone"));
        assert!(!is_soft_closing("今天天气不错"));
    }

    #[test]
    fn closing_phrase_matches_reply_farewells() {
        assert!(is_closing_phrase("那就明天见吧"));
        assert!(is_closing_phrase("祝你好梦"));
        assert!(is_closing_phrase("ok, see you tomorrow"));
        assert!(!is_closing_phrase("我们继续讨论"));
    }

    #[test]
    fn explicit_stop_matches_whole_message_only() {
        assert!(is_explicit_stop("/stop"));
        assert!(is_explicit_stop("stop"));
        assert!(is_explicit_stop("  结束。 "));
        assert!(is_explicit_stop("终止！"));
        assert!(!is_explicit_stop("please stop doing that"));
        assert!(!is_explicit_stop("the bus stop"));
    }

    // ── Heat ──────────────────────────────────────────────────────────────────

    fn policy(participants: usize) -> StopPolicy {
        StopPolicy::new(2, 0.6, 0.9, participants, &[])
    }

    #[test]
    fn heat_saturates_at_one() {
        let mut p = policy(2);
        let long_text = format!("{}?", "词".repeat(200));
        let v = p.observe_round(&long_text, &["Ada".to_string(), "Ben".to_string()], &[]);
        assert!((v.heat - 1.0).abs() < 1e-6);
    }

    #[test]
    fn short_flat_rounds_trigger_low_heat_stop() {
        let mut p = policy(2);
        let v1 = p.observe_round("嗯", &["Ada".to_string()], &[]);
        assert!(!v1.should_stop, "window not yet full");
        let v2 = p.observe_round("哦", &[], &[]);
        assert!(v2.should_stop);
        assert_eq!(v2.reason, Some(StopReason::LowHeat));
    }

    #[test]
    fn lively_rounds_do_not_stop() {
        let mut p = policy(3);
        let lively = "这个问题很有意思，我认为关键在于系统的调度策略，你们觉得呢？\
                      另外我想补充一点关于冷却时间的观察，说不定能解释刚才的现象";
        let v1 = p.observe_round(lively, &["Ada".to_string()], &[]);
        let v2 = p.observe_round(
            "我不同意，调度只是表象，真正的原因是记忆窗口的截断导致上下文缺失，\
             这会让模型重复之前说过的内容，需要从数据层面解决？",
            &["Ben".to_string()],
            &[],
        );
        assert!(!v1.should_stop);
        assert!(!v2.should_stop);
    }

    #[test]
    fn redundancy_streak_stops_after_two_similar_rounds() {
        let mut p = policy(2);
        // Long enough to keep heat high, so only redundancy can stop it.
        let text = "我们今天讨论的调度策略确实很有价值，冷却机制能避免单个角色霸占对话，\
                    主动性分数又保证了整体的活跃程度，沉默检测让冷场时还能重新点燃话题，\
                    整体设计相当平衡，继续保持这个方向就可以了";
        let _ = p.observe_round(text, &["Ada".to_string()], &[]);
        let v2 = p.observe_round(text, &["Ben".to_string()], &[]);
        assert!(!v2.should_stop, "streak is 1 after first repeat");
        let v3 = p.observe_round(text, &["Ada".to_string()], &[]);
        assert!(v3.should_stop);
        assert_eq!(v3.reason, Some(StopReason::Redundancy));
        assert!(v3.similarity > 0.9);
    }

    #[test]
    fn question_resets_redundancy_streak() {
        let mut p = policy(2);
        let text = "重复的总结内容，重复的总结内容，重复的总结内容，重复的总结内容，\
                    重复的总结内容，重复的总结内容，重复的总结内容，重复的总结内容";
        let _ = p.observe_round(text, &["Ada".to_string()], &[]);
        let with_q = format!("{text}？");
        let v = p.observe_round(&with_q, &["Ben".to_string()], &[]);
        assert_ne!(v.reason, Some(StopReason::Redundancy));
    }

    #[test]
    fn new_mentions_reset_redundancy_streak() {
        let mut p = policy(3);
        let text = "重复内容重复内容重复内容重复内容重复内容重复内容重复内容重复内容\
                    重复内容重复内容重复内容重复内容重复内容重复内容";
        let _ = p.observe_round(text, &["Ada".to_string()], &[]);
        let v = p.observe_round(text, &["Ben".to_string()], &["Cyn".to_string()]);
        assert_ne!(v.reason, Some(StopReason::Redundancy));
    }

    #[test]
    fn initial_mentions_do_not_count_as_new() {
        let mut p = StopPolicy::new(2, 0.6, 0.9, 2, &["Ada".to_string()]);
        let v = p.observe_round("嗯", &[], &["Ada".to_string()]);
        // Ada was already known, so no mention bonus: heat stays tiny.
        assert!(v.heat < 0.1);
    }
}
