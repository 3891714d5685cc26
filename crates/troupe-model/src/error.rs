// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Upstream failure classification.
//!
//! Provider errors are never retried by the engine; each one collapses into
//! a single synthetic reply token so the conversation can continue with the
//! remaining speakers.  Classification is by substring because the wire
//! formats vary wildly between vendors; the status code usually appears in
//! the error text produced by the chat driver.

/// Failure class of an upstream LLM error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    InsufficientFunds,
    Auth,
    RateLimit,
    Other,
}

impl UpstreamErrorKind {
    /// Classify an error message by substring / embedded status code.
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_lowercase();
        if message.contains("balance is insufficient") || message.contains("30001") {
            Self::InsufficientFunds
        } else if message.contains("401") || lowered.contains("authentication") {
            Self::Auth
        } else if message.contains("429") || lowered.contains("rate limit") {
            Self::RateLimit
        } else {
            Self::Other
        }
    }

    /// Render the single synthetic token emitted in place of a reply.
    pub fn system_notice(&self, message: &str) -> String {
        match self {
            Self::InsufficientFunds => "[系统提示] API 账户余额不足，请充值后再试。".to_string(),
            Self::Auth => "[系统提示] API 认证失败，请检查 API Key 配置。".to_string(),
            Self::RateLimit => "[系统提示] API 请求频率超限，请稍后再试。".to_string(),
            Self::Other => {
                format!("[系统提示] API 调用失败，请检查 API 可用性与配置：{message}")
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_insufficient_funds_by_phrase() {
        let k = UpstreamErrorKind::classify("Account balance is insufficient for this call");
        assert_eq!(k, UpstreamErrorKind::InsufficientFunds);
    }

    #[test]
    fn classify_insufficient_funds_by_code() {
        let k = UpstreamErrorKind::classify("upstream returned 30001");
        assert_eq!(k, UpstreamErrorKind::InsufficientFunds);
    }

    #[test]
    fn classify_auth_by_status() {
        assert_eq!(UpstreamErrorKind::classify("error 401: nope"), UpstreamErrorKind::Auth);
    }

    #[test]
    fn classify_auth_case_insensitive() {
        assert_eq!(
            UpstreamErrorKind::classify("Authentication failed for key"),
            UpstreamErrorKind::Auth
        );
    }

    #[test]
    fn classify_rate_limit() {
        assert_eq!(UpstreamErrorKind::classify("HTTP 429"), UpstreamErrorKind::RateLimit);
        assert_eq!(
            UpstreamErrorKind::classify("Rate limit exceeded, slow down"),
            UpstreamErrorKind::RateLimit
        );
    }

    #[test]
    fn classify_other_for_anything_else() {
        assert_eq!(
            UpstreamErrorKind::classify("connection reset by peer"),
            UpstreamErrorKind::Other
        );
    }

    #[test]
    fn balance_phrase_wins_over_auth_status() {
        // Ordering matters: the funds check runs before the status checks.
        let k = UpstreamErrorKind::classify("30001: authentication required");
        assert_eq!(k, UpstreamErrorKind::InsufficientFunds);
    }

    #[test]
    fn notices_use_fixed_prefixes() {
        assert!(UpstreamErrorKind::Auth
            .system_notice("ignored")
            .starts_with("[系统提示] API 认证失败"));
        assert!(UpstreamErrorKind::InsufficientFunds
            .system_notice("ignored")
            .starts_with("[系统提示] API 账户余额不足"));
        assert!(UpstreamErrorKind::RateLimit
            .system_notice("ignored")
            .starts_with("[系统提示] API 请求频率超限"));
    }

    #[test]
    fn other_notice_includes_message() {
        let n = UpstreamErrorKind::Other.system_notice("boom");
        assert!(n.starts_with("[系统提示] API 调用失败"));
        assert!(n.ends_with("boom"));
    }
}
