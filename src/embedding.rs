//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and two concrete providers:
//! - **[`LocalEmbedder`]** — deterministic character-trigram feature hashing
//!   into a fixed number of buckets. No model download, no network; the same
//!   text always maps to the same unit vector, which keeps clustering
//!   replayable and tests hermetic.
//! - **[`RemoteEmbedder`]** — calls an OpenAI-compatible `/v1/embeddings`
//!   endpoint with retry and exponential backoff.
//!
//! Also provides vector utilities shared across the pipeline:
//! - [`unit_normalize`] — scale a vector to unit length
//! - [`cosine_similarity`] — similarity between two vectors
//! - [`vec_to_hex`] / [`hex_to_vec`] — the canonical record encoding for
//!   vectors (little-endian f32 bytes, hex)
//!
//! # Retry Strategy (remote)
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;

/// Trait for embedding providers.
///
/// Outputs are unit-normalized vectors of exactly `dim()` entries; a
/// provider returning a different width is an invariant violation and the
/// caller must treat it as fatal for the operation.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"all-MiniLM-L6-v2"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dim(&self) -> usize;
    /// Embed a single text into a unit-norm vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Create the appropriate [`Embedder`] based on configuration.
///
/// | Config value | Provider |
/// |--------------|----------|
/// | `"local"` | [`LocalEmbedder`] |
/// | `"remote"` | [`RemoteEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(LocalEmbedder::new(config))),
        "remote" => Ok(Box::new(RemoteEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: '{}'", other),
    }
}

// ============ Local provider ============

/// Deterministic local embedder using signed feature hashing.
///
/// Each character trigram of the input is hashed (SHA-256) to a bucket in
/// `[0, dim)` with a sign bit; bucket weights are accumulated and the final
/// vector is unit-normalized. Trigram hashing is crude next to a sentence
/// transformer, but it is stable across runs and platforms, which is what
/// the clustering invariants need.
pub struct LocalEmbedder {
    model: String,
    dim: usize,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model: config.model.clone(),
            dim: config.dim,
        }
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dim];
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            bail!("cannot embed empty text");
        }

        let grams: Vec<String> = if chars.len() < 3 {
            vec![chars.iter().collect()]
        } else {
            chars.windows(3).map(|w| w.iter().collect()).collect()
        };

        for gram in &grams {
            let digest = Sha256::digest(gram.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dim;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }

        Ok(unit_normalize(&v))
    }
}

// ============ Remote provider ============

/// Embedding provider calling an OpenAI-compatible embeddings endpoint.
///
/// Requires the `OPENAI_API_KEY` environment variable. Batching is not
/// needed here: the embed worker processes one signal at a time.
pub struct RemoteEmbedder {
    model: String,
    dim: usize,
    endpoint: String,
    timeout: Duration,
    max_retries: u32,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            model: config.model.clone(),
            dim: config.dim,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string()),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vector = parse_embedding_response(&json)?;
                        if vector.len() != self.dim {
                            bail!(
                                "embedding width mismatch: provider returned {} dims, expected {}",
                                vector.len(),
                                self.dim
                            );
                        }
                        return Ok(unit_normalize(&vector));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow!("embedding API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("embedding failed after retries")))
    }
}

/// Extract the first `data[].embedding` array from an embeddings response.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("invalid embeddings response: missing data array"))?;

    let first = data
        .first()
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("invalid embeddings response: missing embedding"))?;

    Ok(first
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Vector utilities ============

/// Scale a vector to unit length. A zero vector is returned unchanged.
pub fn unit_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Compute cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
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

/// Encode a float vector as hex of little-endian f32 bytes.
///
/// This is the canonical encoding for vectors held inside record field
/// maps; the store's vector indices keep their own binary copy. Indices
/// are rebuildable from records because of this duplication.
pub fn vec_to_hex(v: &[f32]) -> String {
    let mut out = String::with_capacity(v.len() * 8);
    for &x in v {
        for byte in x.to_le_bytes() {
            out.push_str(&format!("{:02x}", byte));
        }
    }
    out
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for &x in v {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Decode a hex-encoded vector produced by [`vec_to_hex`].
pub fn hex_to_vec(s: &str) -> Result<Vec<f32>> {
    if s.len() % 8 != 0 {
        bail!("invalid vector encoding: length {} is not a multiple of 8", s.len());
    }
    let mut bytes = Vec::with_capacity(s.len() / 2);
    let raw = s.as_bytes();
    for pair in raw.chunks_exact(2) {
        let hi = hex_digit(pair[0])?;
        let lo = hex_digit(pair[1])?;
        bytes.push(hi << 4 | lo);
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => bail!("invalid hex digit: {}", b as char),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(provider: &str) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: provider.to_string(),
            model: "test-model".to_string(),
            dim: 64,
            endpoint: None,
            timeout_secs: 30,
            max_retries: 2,
        }
    }

    #[test]
    fn test_vec_hex_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let hex = vec_to_hex(&v);
        let restored = hex_to_vec(&hex).unwrap();
        assert_eq!(v, restored);
    }

    #[test]
    fn test_hex_rejects_odd_length() {
        assert!(hex_to_vec("abc").is_err());
        assert!(hex_to_vec("zzzzzzzz").is_err());
    }

    #[test]
    fn test_unit_normalize() {
        let v = unit_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unit_normalize_zero_vector() {
        let v = unit_normalize(&[0.0, 0.0]);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_local_embedder_deterministic() {
        let e = LocalEmbedder::new(&test_config("local"));
        let a = e.embed("sync fails on ios").await.unwrap();
        let b = e.embed("sync fails on ios").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_local_embedder_similar_texts_closer() {
        let e = LocalEmbedder::new(&test_config("local"));
        let a = e.embed("the sync button crashes the app").await.unwrap();
        let b = e.embed("the sync button crashes my app").await.unwrap();
        let c = e.embed("completely unrelated topic about fonts").await.unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    async fn test_local_embedder_rejects_empty() {
        let e = LocalEmbedder::new(&test_config("local"));
        assert!(e.embed("").await.is_err());
    }

    #[test]
    fn test_create_embedder_unknown_provider() {
        assert!(create_embedder(&test_config("cohere")).is_err());
    }
}
