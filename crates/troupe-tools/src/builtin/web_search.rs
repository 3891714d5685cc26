// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Lightweight web search over the DuckDuckGo HTML endpoint.
//!
//! Result anchors are extracted straight from the HTML; when
//! `fetch_snippets` is set each result URL is fetched and converted to
//! plain text, capped at `max_fetch_chars`.  Failures never bubble up as
//! tool errors; the agent gets an empty result list and decides what to
//! do with it.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::tool::{Tool, ToolCall, ToolOutput};

const DDG_HTML_SEARCH: &str = "https://duckduckgo.com/html/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

pub struct WebSearchTool {
    max_fetch_chars: usize,
    client: reqwest::Client,
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new(1200)
    }
}

impl WebSearchTool {
    pub fn new(max_fetch_chars: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent("troupe/0.1")
            .build()
            .expect("reqwest client");
        Self { max_fetch_chars, client }
    }

    async fn search(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<(String, String)>> {
        let resp = self
            .client
            .get(DDG_HTML_SEARCH)
            .query(&[("q", query)])
            .send()
            .await?;
        let html = resp.text().await?;
        Ok(extract_result_anchors(&html, top_k))
    }

    async fn fetch_snippet(&self, url: &str) -> anyhow::Result<String> {
        let resp = self.client.get(url).send().await?;
        let html = resp.text().await?;
        let text = html2text::from_read(html.as_bytes(), 120);
        let collapsed = collapse_whitespace(&text);
        Ok(truncate_chars(&collapsed, self.max_fetch_chars))
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "搜索互联网获取最新公开信息（如新闻、价格、版本号、事实核查等）。\
         返回相关网页的标题、链接和摘要，可用于引用外部来源。"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query string"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Max number of search results (1-8, default 3)"
                },
                "fetch_snippets": {
                    "type": "boolean",
                    "description": "Whether to fetch page snippets for top results (default true)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let query = match call.args.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => return ToolOutput::err(&call.id, "missing 'query'"),
        };
        let top_k = call
            .args
            .get("top_k")
            .and_then(|v| v.as_u64())
            .unwrap_or(3)
            .clamp(1, 8) as usize;
        let fetch_snippets = call
            .args
            .get("fetch_snippets")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        debug!(query = %query, top_k, fetch_snippets, "web_search tool");

        let pairs = match self.search(&query, top_k).await {
            Ok(p) => p,
            Err(e) => {
                warn!("web search failed: {e}");
                return ToolOutput::ok(&call.id, json!({ "results": [] }).to_string());
            }
        };

        let mut results = Vec::with_capacity(pairs.len());
        for (title, url) in pairs {
            let snippet = if fetch_snippets {
                match self.fetch_snippet(&url).await {
                    Ok(s) if !s.is_empty() => Some(s),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(url = %url, "snippet fetch failed: {e}");
                        None
                    }
                }
            } else {
                None
            };
            results.push(json!({ "title": title, "url": url, "snippet": snippet }));
        }

        ToolOutput::ok(&call.id, json!({ "results": results }).to_string())
    }
}

/// Extract `(title, url)` pairs from DuckDuckGo result anchors.
fn extract_result_anchors(html: &str, top_k: usize) -> Vec<(String, String)> {
    static ANCHOR: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(|| {
        Regex::new(r#"(?is)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap()
    });
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]+>").unwrap());

    let mut results = Vec::new();
    for cap in anchor.captures_iter(html) {
        let url = cap[1].trim().to_string();
        let title = tag.replace_all(&cap[2], "").trim().to_string();
        results.push((title, url));
        if results.len() >= top_k {
            break;
        }
    }
    results
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_ws = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_ws {
                out.push(' ');
            }
            last_ws = true;
        } else {
            out.push(c);
            last_ws = false;
        }
    }
    out.trim().to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
