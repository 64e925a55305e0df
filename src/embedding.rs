//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and three backends:
//! - **[`HashEmbedder`]** — deterministic local feature-hashing vectors; no
//!   network, identical text always maps to the identical vector. The default,
//!   and what the test suite runs against.
//! - **[`OpenAiEmbedder`]** — `POST /v1/embeddings` with batching, retry, and
//!   exponential backoff.
//! - **[`OllamaEmbedder`]** — a local Ollama instance's `/api/embed` endpoint.
//!
//! Also provides the vector utilities shared by the retriever and evaluator:
//! [`vec_to_blob`] / [`blob_to_vec`] for BLOB storage and
//! [`cosine_similarity`] / [`similarity_score`] for scoring.
//!
//! # Retry Strategy
//!
//! Remote providers retry transient failures with exponential backoff:
//! HTTP 429 and 5xx retry; other 4xx fail immediately as non-retryable;
//! network errors and timeouts retry. Backoff: 1s, 2s, 4s, ... capped at 2^5.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};

/// An embedding backend. Returns one vector per input text, in order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"` or `"hash-384"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Convenience wrapper for single-query embedding.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let vectors = embedder.embed(&[text.to_string()]).await?;
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::upstream("empty embedding response", true))
}

/// Build the embedder named by the configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new(config.dims))),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        other => Err(PipelineError::invalid(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Hash provider ============

/// Deterministic bag-of-words feature hashing.
///
/// Each lowercased alphanumeric token is hashed into one of `dims` buckets
/// with a hash-derived sign, and the resulting vector is L2-normalized.
/// Identical texts embed identically (cosine 1.0); texts sharing vocabulary
/// land near each other; disjoint texts score near zero.
pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            model: format!("hash-{}", dims),
            dims,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];

        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes(digest[0..8].try_into().unwrap()) as usize % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }

        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ OpenAI provider ============

/// Embedding provider using the OpenAI embeddings API.
///
/// Requires `OPENAI_API_KEY` in the environment and `embedding.model` in
/// config.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    max_retries: u32,
    timeout_secs: u64,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| PipelineError::invalid("embedding.model required for openai provider"))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(PipelineError::invalid(
                "OPENAI_API_KEY environment variable not set",
            ));
        }
        Ok(Self {
            model,
            dims: config.dims,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::invalid("OPENAI_API_KEY not set"))?;

        let client = http_client(self.timeout_secs)?;
        let body = serde_json::json!({ "model": self.model, "input": texts });

        let json = post_with_backoff(
            &client,
            "https://api.openai.com/v1/embeddings",
            Some(&api_key),
            &body,
            self.max_retries,
            "OpenAI embeddings",
        )
        .await?;

        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| PipelineError::upstream("invalid OpenAI response: missing data", false))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    PipelineError::upstream("invalid OpenAI response: missing embedding", false)
                })?;
            embeddings.push(
                embedding
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect(),
            );
        }
        Ok(embeddings)
    }
}

// ============ Ollama provider ============

/// Embedding provider using a local Ollama instance (`POST /api/embed`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| PipelineError::invalid("embedding.model required for ollama provider"))?;
        Ok(Self {
            model,
            dims: config.dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = http_client(self.timeout_secs)?;
        let body = serde_json::json!({ "model": self.model, "input": texts });

        let json = post_with_backoff(
            &client,
            &format!("{}/api/embed", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama embeddings",
        )
        .await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                PipelineError::upstream("invalid Ollama response: missing embeddings", false)
            })?;

        let mut result = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            let vec: Vec<f32> = embedding
                .as_array()
                .ok_or_else(|| {
                    PipelineError::upstream("invalid Ollama response: embedding not an array", false)
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            result.push(vec);
        }
        Ok(result)
    }
}

// ============ Shared HTTP plumbing ============

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::upstream(format!("http client build failed: {}", e), false))
}

/// POST a JSON body, retrying 429/5xx/network errors with exponential backoff.
pub(crate) async fn post_with_backoff(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    what: &str,
) -> Result<serde_json::Value> {
    let mut last_err: Option<PipelineError> = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(key) = bearer {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        PipelineError::upstream(format!("{}: bad response body: {}", what, e), true)
                    });
                }

                let text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(PipelineError::upstream(
                        format!("{} error {}: {}", what, status, text),
                        true,
                    ));
                    continue;
                }
                // Client error other than 429: not worth retrying.
                return Err(PipelineError::upstream(
                    format!("{} error {}: {}", what, status, text),
                    false,
                ));
            }
            Err(e) => {
                let retryable = true; // network error or timeout
                last_err = Some(PipelineError::upstream(
                    format!("{} request failed: {}", what, e),
                    retryable,
                ));
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| PipelineError::upstream(format!("{} failed after retries", what), true)))
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in [-1, 1]. Returns 0.0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Monotonic map from cosine similarity to a [0, 1] score.
pub fn similarity_score(a: &[f32], b: &[f32]) -> f64 {
    ((cosine_similarity(a, b) as f64) + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(128);
        let texts = vec!["The fund invests in late-stage ventures.".to_string()];
        let a = embedder.embed(&texts).await.unwrap();
        let b = embedder.embed(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 128);
    }

    #[tokio::test]
    async fn hash_embedder_identical_texts_score_one() {
        let embedder = HashEmbedder::new(256);
        let v = embed_query(&embedder, "compliance is monitored quarterly")
            .await
            .unwrap();
        assert!((similarity_score(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn hash_embedder_related_beats_unrelated() {
        let embedder = HashEmbedder::new(256);
        let question = embed_query(&embedder, "How is compliance monitored at the firm?")
            .await
            .unwrap();
        let related = embed_query(&embedder, "Compliance at the firm is monitored by an officer.")
            .await
            .unwrap();
        let unrelated = embed_query(&embedder, "Bananas ripen faster in paper bags.")
            .await
            .unwrap();
        assert!(
            similarity_score(&question, &related) > similarity_score(&question, &unrelated),
            "related text should outscore unrelated text"
        );
    }

    #[tokio::test]
    async fn hash_embedder_normalizes() {
        let embedder = HashEmbedder::new(64);
        let v = embed_query(&embedder, "alpha beta gamma").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
