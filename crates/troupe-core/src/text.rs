// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Text utilities shared by the conversation loop: mention extraction,
//! special-token filtering and the lightweight similarity measure used by
//! the smart-stop policy.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([\w\-\x{4e00}-\x{9fff}]+)").unwrap())
}

fn special_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Tokenizer artifacts like <|pad|>, <|eos|>, <｜▁pad▁｜> (fullwidth bar).
    RE.get_or_init(|| Regex::new(r"<[|｜][^|｜]*[|｜]>").unwrap())
}

fn similarity_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Latin word-like runs or single Han characters.
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_]+|[\x{4e00}-\x{9fff}]").unwrap())
}

/// Extract mentioned persona names from text, preserving order.
///
/// `personas` is a list of `(name, handle)` pairs.  Pass one: explicit
/// `@handle` (or `@Name`) mentions in order of first occurrence.  Pass two,
/// only when the first found nothing: substring match of handle or name,
/// ordered by first occurrence index.
pub fn extract_tags(text: &str, personas: &[(String, String)]) -> Vec<String> {
    if text.is_empty() || personas.is_empty() {
        return Vec::new();
    }
    let lowered = text.to_lowercase();

    let handle_to_name: HashMap<String, &str> = personas
        .iter()
        .map(|(name, handle)| (handle.to_lowercase(), name.as_str()))
        .collect();

    let mut ordered: Vec<String> = Vec::new();
    for cap in mention_re().captures_iter(text) {
        let key = cap[1].to_lowercase();
        let name = handle_to_name.get(key.as_str()).copied().or_else(|| {
            personas
                .iter()
                .find(|(name, _)| name.to_lowercase() == key)
                .map(|(name, _)| name.as_str())
        });
        if let Some(name) = name {
            if !ordered.iter().any(|n| n == name) {
                ordered.push(name.to_string());
            }
        }
    }
    if !ordered.is_empty() {
        return ordered;
    }

    // Fallback: substring heuristic, ordered by first occurrence.
    let mut candidates: Vec<(usize, &str)> = Vec::new();
    for (name, handle) in personas {
        let h = handle.to_lowercase();
        let n = name.to_lowercase();
        let idx = if !h.is_empty() && lowered.contains(&h) {
            lowered.find(&h)
        } else if !n.is_empty() && lowered.contains(&n) {
            lowered.find(&n)
        } else {
            None
        };
        if let Some(idx) = idx {
            candidates.push((idx, name.as_str()));
        }
    }
    candidates.sort_by_key(|(idx, _)| *idx);
    candidates.into_iter().map(|(_, name)| name.to_string()).collect()
}

/// Strip tokenizer artifacts (`<|…|>`, `<｜…｜>`) from model output.
pub fn filter_special_tokens(text: &str) -> String {
    special_token_re().replace_all(text, "").into_owned()
}

/// Bag-of-tokens vector for the redundancy check.  Case-insensitive; Latin
/// word runs and single CJK characters count as tokens.
pub fn tokenize_for_similarity(text: &str) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    if text.is_empty() {
        return counts;
    }
    let lowered = text.to_lowercase();
    for m in similarity_token_re().find_iter(&lowered) {
        *counts.entry(m.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Cosine similarity over integer count vectors; 0.0 when either is empty.
pub fn cosine_similarity(a: &HashMap<String, u32>, b: &HashMap<String, u32>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: u64 = a
        .iter()
        .filter_map(|(k, va)| b.get(k).map(|vb| u64::from(*va) * u64::from(*vb)))
        .sum();
    if dot == 0 {
        return 0.0;
    }
    let norm = |v: &HashMap<String, u32>| {
        (v.values().map(|x| u64::from(*x) * u64::from(*x)).sum::<u64>() as f64).sqrt()
    };
    let na = norm(a);
    let nb = norm(b);
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot as f64 / (na * nb)) as f32
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
