// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retrieval-augmented context for personas.
//!
//! Each (user, persona) pair owns an isolated vector collection named
//! `{user}_persona_{id}_rag`; the collection name alone enforces tenant
//! isolation.  Ingestion chunks text, embeds it through the user's
//! embedding profile and stores one vector per chunk; retrieval embeds the
//! query the same way and returns the closest passages.

mod chunker;
mod embedding;
mod scope;
mod service;
mod store;

pub use chunker::split_text;
pub use embedding::{EmbeddingClient, HttpEmbeddingClient, MockEmbeddingClient};
pub use scope::RetrievalScope;
pub use service::{Passage, RetrievalService};
pub use store::{MemoryVectorStore, SearchHit, VectorRecord, VectorStore};
