// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! LLM wire layer: message types, the [`ModelProvider`] trait, a streaming
//! OpenAI-compatible chat driver, and deterministic mock providers for tests.

mod chat;
mod error;
mod mock;
mod provider;
mod types;

pub use chat::ChatCompletionsProvider;
pub use error::UpstreamErrorKind;
pub use mock::{FailingProvider, MockProvider, ScriptedMockProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use types::{
    CompletionRequest, FunctionCall, Message, MessageContent, ResponseEvent, Role, ToolSchema,
};
