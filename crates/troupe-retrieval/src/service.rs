// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use anyhow::bail;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{split_text, EmbeddingClient, VectorRecord, VectorStore};

/// One retrieved background passage.
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Ingestion + retrieval over per-(user, persona) collections.
pub struct RetrievalService {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RetrievalService {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { store, embedder, chunk_size: 500, chunk_overlap: 50 }
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    /// User-namespaced collection name; the name alone enforces isolation.
    pub fn collection_name(user: &str, persona_id: i64) -> String {
        format!("{user}_persona_{persona_id}_rag")
    }

    /// Chunk, embed and store `text` under the persona's collection.
    /// Returns the number of chunks inserted.
    pub async fn ingest_text(
        &self,
        user: &str,
        persona_id: i64,
        text: &str,
        source: Option<&str>,
    ) -> anyhow::Result<usize> {
        let chunks = split_text(text, self.chunk_size, self.chunk_overlap);
        if chunks.is_empty() {
            return Ok(0);
        }
        let collection = Self::collection_name(user, persona_id);
        info!(collection = %collection, chunks = chunks.len(), "ingesting background text");

        let mut embeddings = self.embedder.embed(&chunks).await?;

        // Some embedding endpoints return several vectors per input (e.g.
        // variants).  Keep one vector per chunk: an integral ratio means a
        // fixed group size, so take the first of each group; otherwise
        // truncate to the chunk count.
        if embeddings.len() != chunks.len() {
            if !embeddings.is_empty() && embeddings.len() % chunks.len() == 0 {
                let group_size = embeddings.len() / chunks.len();
                warn!(
                    embeddings = embeddings.len(),
                    chunks = chunks.len(),
                    group_size,
                    "embedding count mismatch; taking first vector of each group"
                );
                embeddings = (0..chunks.len())
                    .map(|i| embeddings[i * group_size].clone())
                    .collect();
            } else {
                warn!(
                    embeddings = embeddings.len(),
                    chunks = chunks.len(),
                    "embedding count mismatch; truncating to chunk count"
                );
                embeddings.truncate(chunks.len());
            }
        }
        if embeddings.len() != chunks.len() {
            bail!(
                "embedding row count {} does not match chunk count {}",
                embeddings.len(),
                chunks.len()
            );
        }

        self.store
            .ensure_collection(&collection, self.embedder.dimension())
            .await?;

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(text, vector)| VectorRecord {
                id: Uuid::new_v4().to_string(),
                vector,
                text,
                source: source.map(str::to_string),
            })
            .collect();
        let inserted = records.len();
        self.store.insert(&collection, records).await?;
        Ok(inserted)
    }

    /// Embed `query` and return the closest passages from the persona's
    /// collection.  A missing collection yields an empty list.
    pub async fn search(
        &self,
        query: &str,
        user: &str,
        persona_id: i64,
        top_k: usize,
    ) -> anyhow::Result<Vec<Passage>> {
        let collection = Self::collection_name(user, persona_id);
        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let Some(query_vec) = vectors.first() else {
            return Ok(Vec::new());
        };
        let hits = self.store.search(&collection, query_vec, top_k).await?;
        Ok(hits
            .into_iter()
            .map(|h| Passage { text: h.text, source: h.source })
            .collect())
    }

    /// Remove the persona's collection entirely (persona deleted or
    /// background replaced).
    pub async fn drop_persona(&self, user: &str, persona_id: i64) -> anyhow::Result<()> {
        self.store
            .drop_collection(&Self::collection_name(user, persona_id))
            .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
