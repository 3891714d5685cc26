// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Background retrieval for the speaking persona.
//!
//! The `(user, persona_id)` pair is read from the [`RetrievalScope`] the
//! conversation loop maintains, never from model-controlled arguments, so
//! a crafted prompt cannot address another tenant's collection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use troupe_retrieval::{RetrievalScope, RetrievalService};

use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct RagQueryTool {
    service: Arc<RetrievalService>,
    scope: RetrievalScope,
}

impl RagQueryTool {
    pub fn new(service: Arc<RetrievalService>, scope: RetrievalScope) -> Self {
        Self { service, scope }
    }
}

#[async_trait]
impl Tool for RagQueryTool {
    fn name(&self) -> &str {
        "rag_query"
    }

    fn description(&self) -> &str {
        "查询当前 Persona 的背景资料与相关知识片段，用于准确回答涉及人物设定、\
         经历或专业知识的问题。返回最相关的文档片段及来源标注。"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Query text to retrieve relevant background"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Max number of passages to return (1-10, default 4)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let query = match call.args.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.is_empty() => q,
            _ => return ToolOutput::err(&call.id, "missing 'query'"),
        };
        let top_k = call
            .args
            .get("top_k")
            .and_then(|v| v.as_u64())
            .unwrap_or(4)
            .clamp(1, 10) as usize;

        // No scope means no speaking persona is active; answer with nothing
        // rather than an error so the agent simply proceeds without context.
        let Some((user, persona_id)) = self.scope.get() else {
            debug!("rag_query called without an active retrieval scope");
            return ToolOutput::ok(&call.id, json!({ "passages": [] }).to_string());
        };

        match self.service.search(query, &user, persona_id, top_k).await {
            Ok(passages) => {
                debug!(user = %user, persona_id, found = passages.len(), "rag_query");
                ToolOutput::ok(&call.id, json!({ "passages": passages }).to_string())
            }
            Err(e) => {
                warn!("rag_query failed: {e}");
                ToolOutput::ok(&call.id, json!({ "passages": [] }).to_string())
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
