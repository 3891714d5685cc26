// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The persona invoker: wraps one persona, its model endpoint and the tool
//! registry behind a streaming `stream(payload)` call.
//!
//! Streaming contract: a producer task writes tokens into a bounded
//! channel; the caller reads the receiver until close.  Dropping the
//! receiver cancels the producer at its next send.  On upstream failure
//! exactly one synthetic `[系统提示]` token is produced and the stream
//! closes; no retries at this level.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use troupe_model::{
    CompletionRequest, FunctionCall, Message, MessageContent, ModelProvider, ResponseEvent, Role,
    ToolSchema, UpstreamErrorKind,
};
use troupe_tools::{ToolCall, ToolRegistry};

/// One `(speaker, content)` history line for prompt assembly.
#[derive(Debug, Clone)]
pub struct HistoryItem {
    pub speaker: String,
    pub content: String,
}

/// Everything one invocation needs to know about the turn.
#[derive(Debug, Clone, Default)]
pub struct InvokePayload {
    pub history: Vec<HistoryItem>,
    pub user_message: String,
    /// When true, `user_message` is an observed-dialogue framing for a
    /// later round and is injected verbatim instead of being wrapped in the
    /// round-0 user framing.
    pub observed: bool,
    /// Participant handles plus the user.
    pub active_participants: Vec<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
}

/// Streams one persona's reply, optionally through tool calls.
#[derive(Clone)]
pub struct PersonaInvoker {
    persona_name: String,
    persona_prompt: String,
    /// Appended as a second system message when present (e.g. `语气：冷静`).
    instructions: Option<String>,
    memory_window: i32,
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
}

/// Tool-call rounds before the model is forced to answer in text.
const MAX_TOOL_ROUNDS: u32 = 4;

impl PersonaInvoker {
    pub fn new(
        persona_name: impl Into<String>,
        persona_prompt: impl Into<String>,
        instructions: Option<String>,
        memory_window: i32,
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            persona_name: persona_name.into(),
            persona_prompt: persona_prompt.into(),
            instructions,
            memory_window,
            model,
            tools,
        }
    }

    pub fn persona_name(&self) -> &str {
        &self.persona_name
    }

    /// Start the producer task and return the token stream.
    pub fn stream(&self, payload: InvokePayload) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();
        tokio::spawn(async move {
            this.run(payload, tx).await;
        });
        rx
    }

    async fn run(self, payload: InvokePayload, tx: mpsc::Sender<String>) {
        let mut messages = self.build_messages(&payload);
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            let with_tools = rounds <= MAX_TOOL_ROUNDS;
            let tools: Vec<ToolSchema> = if with_tools {
                self.tools
                    .schemas()
                    .into_iter()
                    .map(|s| ToolSchema {
                        name: s.name,
                        description: s.description,
                        parameters: s.parameters,
                    })
                    .collect()
            } else {
                Vec::new()
            };

            let req = CompletionRequest { messages: messages.clone(), tools, stream: true };
            let mut stream = match self.model.complete(req).await {
                Ok(s) => s,
                Err(e) => {
                    let msg = e.to_string();
                    warn!(persona = %self.persona_name, "model call failed: {msg}");
                    let notice = UpstreamErrorKind::classify(&msg).system_notice(&msg);
                    let _ = tx.send(notice).await;
                    return;
                }
            };

            let mut full_text = String::new();
            // Keyed by the parallel-tool-call index from the provider.
            let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(ResponseEvent::TextDelta(delta)) if !delta.is_empty() => {
                        full_text.push_str(&delta);
                        if tx.send(delta).await.is_err() {
                            // Receiver gone: consumer cancelled the turn.
                            return;
                        }
                    }
                    Ok(ResponseEvent::TextDelta(_)) => {}
                    Ok(ResponseEvent::ToolCall { index, id, name, arguments }) => {
                        let ptc = pending.entry(index).or_default();
                        if !id.is_empty() {
                            ptc.id = id;
                        }
                        if !name.is_empty() {
                            ptc.name = name;
                        }
                        ptc.args_buf.push_str(&arguments);
                    }
                    Ok(ResponseEvent::Done) => break,
                    Ok(ResponseEvent::Error(e)) => {
                        warn!(persona = %self.persona_name, "model stream warning: {e}");
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        warn!(persona = %self.persona_name, "stream failed: {msg}");
                        let notice = UpstreamErrorKind::classify(&msg).system_notice(&msg);
                        let _ = tx.send(notice).await;
                        return;
                    }
                }
            }

            // Flush accumulated tool calls ordered by index; calls without a
            // name cannot be dispatched and are dropped.
            let mut pending_sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
            pending_sorted.sort_by_key(|(idx, _)| *idx);
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            for (i, (_, ptc)) in pending_sorted.into_iter().enumerate() {
                if ptc.name.is_empty() {
                    warn!("dropping tool call with empty name from model");
                    continue;
                }
                tool_calls.push(ptc.finish(i));
            }

            if tool_calls.is_empty() || !with_tools {
                // Terminal text turn; everything was already streamed.
                return;
            }

            if !full_text.is_empty() {
                messages.push(Message::assistant(&full_text));
            }

            for tc in &tool_calls {
                messages.push(Message {
                    role: Role::Assistant,
                    content: MessageContent::ToolCall {
                        tool_call_id: tc.id.clone(),
                        function: FunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.args.to_string(),
                        },
                    },
                });
            }

            for tc in &tool_calls {
                debug!(persona = %self.persona_name, tool = %tc.name, "executing tool call");
                let output = self.tools.execute(tc).await;
                let content = if output.is_error {
                    format!("error: {}", output.content)
                } else {
                    output.content
                };
                messages.push(Message::tool_result(&tc.id, &content));
            }
        }
    }

    /// Assemble the message list: system prompt, optional instructions,
    /// history window, then the user turn.
    fn build_messages(&self, payload: &InvokePayload) -> Vec<Message> {
        let mut user_info = String::new();
        if payload.user_display_name.is_some()
            || payload.user_handle.is_some()
            || payload.user_persona.is_some()
        {
            let name_part = payload.user_display_name.as_deref().unwrap_or("用户");
            let handle_part = payload
                .user_handle
                .as_deref()
                .map(|h| format!(" (@{h})"))
                .unwrap_or_default();
            user_info = format!("【用户身份信息】\n对话中的用户是：{name_part}{handle_part}\n");
            if let Some(desc) = &payload.user_persona {
                user_info.push_str(&format!("用户的角色描述：{desc}\n"));
            }
            user_info.push('\n');
        }

        let mut participants_info = String::new();
        if !payload.active_participants.is_empty() {
            let list = payload
                .active_participants
                .iter()
                .map(|p| format!("@{p}"))
                .collect::<Vec<_>>()
                .join("、");
            participants_info = format!(
                "【当前会话参与者】\n本次对话的参与者有：{list}\n\
                 ⚠️ 重要：你只能 @ 上述列表中的人，不要 @ 不在此列表中的人！\n\n"
            );
        }

        let system_prompt = format!(
            "你是{name}。{prompt}\n\n你正在参与一个多人自由对话。请注意：\n\n\
{user_info}{participants_info}【对话规则】
1. 这是自然的多人在一起的互动对话，不是一问一答。
2. 你可以：
   - 回应其他人的观点（不需要被 @ 也可以回应）
   - 提出自己的问题或想法
   - 对感兴趣的话题发表看法
   - @ 其他人邀请他们参与（格式：@某人，仅限参与者列表中的人）
   - 对某个观点表示赞同或提出不同看法

【何时发言】
✅ 应该发言的情况：
   - 有人 @ 你
   - 话题与你的专长或兴趣相关
   - 你对刚才的观点有独特见解
   - 你想补充或纠正某个信息
   - 对话冷场时可以提出新话题

❌ 不要发言的情况：
   - 别人已经说得很完整了
   - 话题完全不在你的专长范围
   - 你没有新的内容可补充
   - 只是为了发言而发言
   - **用户只说了简单的问候（如\"你好\"、\"晚上好\"）时，简短回应即可，不要自己延伸出新话题或提及不存在的上下文**

【发言风格】
- 保持你的个性特点：{prompt}
- 自然、真实，像真人在聊天
- 可以简短，不需要每次都长篇大论
- 可以表达情绪和态度
- **根据对话实际内容回复，不要凭空编造或提及对话中没有出现过的事情**

【身份与发言身份】
- 只以你自己的身份发言，绝不假扮他人
- 不要替他人说话或用他人的第一人称回复
- 如果需要引用他人的观点，请用第三人称描述

【重要规则】
1. 如果下文中提供了「检索到的相关资料」，请优先基于这些资料回答，确保回答准确且符合角色设定。
2. 只基于已有的对话历史回复，不要假设或编造对话中未出现的内容，不知道的内容调用网络检索工具。
3. 如果用户只是简单问候，简短回应即可，不要过度延伸。

【可用工具（高优先级）】
- web_search：用于检索最新公开信息（新闻、版本、价格等）。当你对事实不确定、涉及时间/地点/事件/行程/更新的信息，或用户要求来源、\"上网查/搜\"时，主动调用该工具，并在回答中引用返回链接。用户没明确要求也要主动查，避免凭空回答。若搜索/网络失败或结果为空，请直说，不要假装已经查阅。
- rag_query：用于查询你的人物背景与相关资料。遇到涉及你背景、设定或过往信息的提问或讨论时，优先调用该工具获取片段并据此作答。

工具使用原则：
- 工具调用优先级仅次于系统提示；必要时请主动调用，无需等待用户明确要求。
- 每轮可按需调用 1-2 次，避免过度调用导致延迟。
- 在回答中标注引用，区分来自工具的结论与个人观点。

记住：这是一群人在一起说话，要像真人一样自然互动！",
            name = self.persona_name,
            prompt = self.persona_prompt,
            user_info = user_info,
            participants_info = participants_info,
        );

        let mut messages = vec![Message::system(system_prompt)];

        if let Some(instructions) = &self.instructions {
            messages.push(Message::system(format!("额外指示：{instructions}")));
        }

        let history = if self.memory_window <= 0 {
            &payload.history[..]
        } else {
            let n = (self.memory_window as usize).min(payload.history.len());
            &payload.history[payload.history.len() - n..]
        };
        for item in history {
            let speaker = if item.speaker == "user" {
                payload.user_display_name.as_deref().unwrap_or(&item.speaker)
            } else {
                &item.speaker
            };
            messages.push(Message::user(format!("{speaker}: {}", item.content)));
        }

        if payload.user_message.is_empty() {
            messages.push(Message::user(
                "[基于以上对话，如果你有想法就发言，如果没什么可说的就保持简短或沉默]",
            ));
        } else if payload.observed {
            messages.push(Message::user(payload.user_message.clone()));
        } else {
            messages.push(Message::user(format!(
                "[用户刚刚说]: {}\n\n现在轮到你发言了。",
                payload.user_message
            )));
        }

        messages
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve to a dispatchable call.  Arguments must parse to a JSON
    /// object; anything else becomes `{}`.  An empty id gets a synthetic
    /// fallback so the conversation history stays well-formed.
    fn finish(self, index: usize) -> ToolCall {
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.args_buf).unwrap_or_else(|e| {
                warn!(tool = %self.name, error = %e, "invalid tool arguments; substituting {{}}");
                serde_json::Value::Object(Default::default())
            })
        };
        let id = if self.id.is_empty() {
            format!("tc_synthetic_{index}")
        } else {
            self.id
        };
        ToolCall { id, name: self.name, args }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_model::{FailingProvider, ScriptedMockProvider};

    fn invoker_with(model: Arc<dyn ModelProvider>) -> PersonaInvoker {
        PersonaInvoker::new(
            "Ada",
            "你是一位研究分布式系统的学者。",
            Some("语气：冷静".into()),
            8,
            model,
            Arc::new(ToolRegistry::new()),
        )
    }

    fn payload(user_message: &str) -> InvokePayload {
        InvokePayload {
            history: vec![
                HistoryItem { speaker: "user".into(), content: "早上好".into() },
                HistoryItem { speaker: "Ben".into(), content: "大家好".into() },
            ],
            user_message: user_message.into(),
            observed: false,
            active_participants: vec!["user".into(), "ada".into(), "ben".into()],
            user_display_name: Some("老王".into()),
            user_handle: Some("wang".into()),
            user_persona: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(tok) = rx.recv().await {
            out.push(tok);
        }
        out
    }

    #[tokio::test]
    async fn streams_text_tokens_in_order() {
        let model = Arc::new(ScriptedMockProvider::new(vec![vec![
            ResponseEvent::TextDelta("你好".into()),
            ResponseEvent::TextDelta("，老王".into()),
            ResponseEvent::Done,
        ]]));
        let inv = invoker_with(model);
        let tokens = collect(inv.stream(payload("在吗？"))).await;
        assert_eq!(tokens, vec!["你好".to_string(), "，老王".to_string()]);
    }

    #[tokio::test]
    async fn auth_failure_yields_single_notice_token() {
        let inv = invoker_with(Arc::new(FailingProvider::new(
            "upstream said: authentication failed",
        )));
        let tokens = collect(inv.stream(payload("hello"))).await;
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].starts_with("[系统提示] API 认证失败"));
    }

    #[tokio::test]
    async fn rate_limit_failure_classified() {
        let inv = invoker_with(Arc::new(FailingProvider::new("HTTP 429 too many requests")));
        let tokens = collect(inv.stream(payload("hello"))).await;
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].starts_with("[系统提示] API 请求频率超限"));
    }

    #[tokio::test]
    async fn tool_call_round_trips_through_registry() {
        use async_trait::async_trait;
        use serde_json::{json, Value};
        use troupe_tools::{Tool, ToolOutput};

        struct WeatherTool;
        #[async_trait]
        impl Tool for WeatherTool {
            fn name(&self) -> &str {
                "weather"
            }
            fn description(&self) -> &str {
                "returns the weather"
            }
            fn parameters_schema(&self) -> Value {
                json!({ "type": "object" })
            }
            async fn execute(&self, call: &ToolCall) -> ToolOutput {
                ToolOutput::ok(&call.id, "sunny, 21C")
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(WeatherTool);

        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1",
            "weather",
            r#"{"city":"Berlin"}"#,
            "柏林今天晴，21 度。",
        ));
        let last_request = model.last_request.clone();
        let inv = PersonaInvoker::new(
            "Ada",
            "prompt",
            None,
            8,
            model,
            Arc::new(registry),
        );
        let tokens = collect(inv.stream(payload("柏林天气如何"))).await;
        assert_eq!(tokens, vec!["柏林今天晴，21 度。".to_string()]);

        // The second model call must carry the tool result message.
        let req = last_request.lock().unwrap().clone().unwrap();
        let has_tool_result = req.messages.iter().any(|m| {
            matches!(&m.content, MessageContent::ToolResult { tool_call_id, content }
                if tool_call_id == "call-1" && content.contains("sunny"))
        });
        assert!(has_tool_result, "tool result missing from follow-up request");
    }

    // ── Prompt assembly ───────────────────────────────────────────────────────

    #[test]
    fn system_prompt_contains_persona_and_participants() {
        let inv = invoker_with(Arc::new(ScriptedMockProvider::always_text("x")));
        let messages = inv.build_messages(&payload("你好"));
        let system = messages[0].as_text().unwrap();
        assert!(system.starts_with("你是Ada。"));
        assert!(system.contains("@ada"));
        assert!(system.contains("【当前会话参与者】"));
        assert!(system.contains("【用户身份信息】"));
        assert!(system.contains("老王 (@wang)"));
    }

    #[test]
    fn instructions_become_second_system_message() {
        let inv = invoker_with(Arc::new(ScriptedMockProvider::always_text("x")));
        let messages = inv.build_messages(&payload("你好"));
        assert_eq!(messages[1].role, Role::System);
        assert_eq!(messages[1].as_text(), Some("额外指示：语气：冷静"));
    }

    #[test]
    fn history_rendered_with_display_name_for_user() {
        let inv = invoker_with(Arc::new(ScriptedMockProvider::always_text("x")));
        let messages = inv.build_messages(&payload("你好"));
        // system, instructions, then history
        assert_eq!(messages[2].as_text(), Some("老王: 早上好"));
        assert_eq!(messages[3].as_text(), Some("Ben: 大家好"));
    }

    #[test]
    fn round_zero_user_turn_uses_fresh_framing() {
        let inv = invoker_with(Arc::new(ScriptedMockProvider::always_text("x")));
        let messages = inv.build_messages(&payload("现在几点了？"));
        let last = messages.last().unwrap().as_text().unwrap();
        assert!(last.starts_with("[用户刚刚说]: 现在几点了？"));
        assert!(last.ends_with("现在轮到你发言了。"));
    }

    #[test]
    fn observed_turn_injected_verbatim() {
        let inv = invoker_with(Arc::new(ScriptedMockProvider::always_text("x")));
        let mut p = payload("你刚刚观察到 \"Ben\" 说: \"大家好\"。现在轮到你发言，你可以对此进行评论，或开启新话题。");
        p.observed = true;
        let messages = inv.build_messages(&p);
        let last = messages.last().unwrap().as_text().unwrap();
        assert!(last.starts_with("你刚刚观察到"));
        assert!(!last.contains("[用户刚刚说]"));
    }

    #[test]
    fn empty_user_message_uses_continuation_framing() {
        let inv = invoker_with(Arc::new(ScriptedMockProvider::always_text("x")));
        let messages = inv.build_messages(&payload(""));
        let last = messages.last().unwrap().as_text().unwrap();
        assert!(last.starts_with("[基于以上对话"));
    }

    #[test]
    fn memory_window_limits_history() {
        let model: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("x"));
        let inv = PersonaInvoker::new("Ada", "p", None, 1, model, Arc::new(ToolRegistry::new()));
        let messages = inv.build_messages(&payload("hi"));
        // system + 1 history entry + user turn = 3
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].as_text(), Some("Ben: 大家好"));
    }

    #[test]
    fn nonpositive_memory_window_feeds_full_history() {
        for window in [0, -1] {
            let model: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("x"));
            let inv =
                PersonaInvoker::new("Ada", "p", None, window, model, Arc::new(ToolRegistry::new()));
            let messages = inv.build_messages(&payload("hi"));
            // system + 2 history entries + user turn = 4
            assert_eq!(messages.len(), 4, "window {window}");
        }
    }
}
