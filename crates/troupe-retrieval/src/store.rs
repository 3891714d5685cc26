// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// One stored row: string UUID key, fixed-dimension vector, text payload and
/// an optional source marker.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub source: Option<String>,
}

/// One search result, closest first (L2 metric).
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub text: String,
    pub source: Option<String>,
    pub distance: f32,
}

/// Vector storage behind the retrieval service.
///
/// Searching a collection that does not exist returns an empty hit list;
/// missing background data is not an error the conversation should see.
/// Inserting rows whose dimension disagrees with the collection is a hard
/// failure.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> anyhow::Result<()>;
    async fn insert(&self, collection: &str, records: Vec<VectorRecord>) -> anyhow::Result<()>;
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
    ) -> anyhow::Result<Vec<SearchHit>>;
    async fn drop_collection(&self, name: &str) -> anyhow::Result<()>;
    async fn has_collection(&self, name: &str) -> bool;
}

struct Collection {
    dimension: usize,
    rows: Vec<VectorRecord>,
}

/// In-process vector store: brute-force L2 scan per collection.
///
/// Collections are small (one persona's background corpus) so a linear scan
/// is well inside budget; an external vector database slots in behind the
/// same trait without touching the service layer.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> anyhow::Result<()> {
        let mut cols = self.collections.write().await;
        match cols.get(name) {
            Some(existing) if existing.dimension != dimension => {
                bail!(
                    "collection {name} exists with dimension {} (requested {dimension})",
                    existing.dimension
                );
            }
            Some(_) => Ok(()),
            None => {
                cols.insert(name.to_string(), Collection { dimension, rows: Vec::new() });
                Ok(())
            }
        }
    }

    async fn insert(&self, collection: &str, records: Vec<VectorRecord>) -> anyhow::Result<()> {
        let mut cols = self.collections.write().await;
        let col = match cols.get_mut(collection) {
            Some(c) => c,
            None => bail!("collection {collection} does not exist"),
        };
        for r in &records {
            if r.vector.len() != col.dimension {
                bail!(
                    "vector dimension {} does not match collection dimension {}",
                    r.vector.len(),
                    col.dimension
                );
            }
        }
        col.rows.extend(records);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let cols = self.collections.read().await;
        let col = match cols.get(collection) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let mut hits: Vec<SearchHit> = col
            .rows
            .iter()
            .map(|r| SearchHit {
                text: r.text.clone(),
                source: r.source.clone(),
                distance: l2_distance(query, &r.vector),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn drop_collection(&self, name: &str) -> anyhow::Result<()> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> bool {
        self.collections.read().await.contains_key(name)
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
