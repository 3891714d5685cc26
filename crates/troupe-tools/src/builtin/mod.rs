// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod rag_query;
mod web_search;

pub use rag_query::RagQueryTool;
pub use web_search::WebSearchTool;
