// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Produces embedding vectors for texts.
///
/// The vector dimension is a property of the user's embedding profile
/// (model-specific, e.g. 1024 or 4096) and must match the collection the
/// vectors land in.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts, one vector per input in order.
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Dimension of the vectors this client produces.
    fn dimension(&self) -> usize;
}

/// OpenAI-compatible `/embeddings` endpoint client.
pub struct HttpEmbeddingClient {
    url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    client: reqwest::Client,
}

impl HttpEmbeddingClient {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        dimension: usize,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            url: format!("{base}/embeddings"),
            model: model.into(),
            api_key,
            dimension,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.model, "input": texts });
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("embedding request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("embedding error {status}: {text}");
        }
        let v: Value = resp.json().await.context("embedding response not JSON")?;
        let data = v["data"]
            .as_array()
            .context("embedding response missing data array")?;
        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let vec = item["embedding"]
                .as_array()
                .context("embedding item missing vector")?
                .iter()
                .map(|x| x.as_f64().unwrap_or(0.0) as f32)
                .collect();
            out.push(vec);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic offline embedder for tests.
///
/// Hashes each text into a seed and expands it with an xorshift generator,
/// so identical texts always embed identically and distinct texts almost
/// never collide.
pub struct MockEmbeddingClient {
    dimension: usize,
}

impl MockEmbeddingClient {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut state: u64 = 0xcbf2_9ce4_8422_2325;
        for b in text.as_bytes() {
            state ^= u64::from(*b);
            state = state.wrapping_mul(0x100_0000_01b3);
        }
        let mut out = Vec::with_capacity(self.dimension);
        for _ in 0..self.dimension {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.push((state as f32 / u64::MAX as f32) - 0.5);
        }
        out
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedding_is_deterministic() {
        let e = MockEmbeddingClient::new(8);
        let a = e.embed(&["hello".to_string()]).await.unwrap();
        let b = e.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn mock_embedding_distinct_texts_differ() {
        let e = MockEmbeddingClient::new(8);
        let out = e
            .embed(&["hello".to_string(), "world".to_string()])
            .await
            .unwrap();
        assert_ne!(out[0], out[1]);
    }

    #[tokio::test]
    async fn mock_embedding_respects_dimension() {
        let e = MockEmbeddingClient::new(17);
        let out = e.embed(&["x".to_string()]).await.unwrap();
        assert_eq!(out[0].len(), 17);
        assert_eq!(e.dimension(), 17);
    }

    #[test]
    fn http_client_builds_embeddings_url() {
        let c = HttpEmbeddingClient::new("http://localhost:1234/v1/", "embed-model", None, 1024);
        assert_eq!(c.url, "http://localhost:1234/v1/embeddings");
        assert_eq!(c.dimension(), 1024);
    }
}
