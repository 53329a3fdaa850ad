//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`HashedEmbedder`]**: deterministic feature hashing, in-process, no model.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with retry and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalProvider`**: fastembed, behind the `local-embeddings-fastembed` feature.
//!
//! # Retries
//!
//! Remote providers retry a request up to `embedding.max_retries` times when
//! the server answers 429 or 5xx, or the connection fails. Any other status
//! fails the batch at once. The wait doubles from one second and stops
//! growing at 32 seconds. Nothing above this module retries a failed build
//! or query.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider(self.model_name(), "empty embedding response"))
    }
}

// ============ Hashed Embedder ============

const DEFAULT_HASHED_DIMS: usize = 256;

/// Feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed (SHA-256) into one of `dims`
/// buckets with a hash-derived sign; the result is L2-normalized. Identical
/// texts map to identical vectors and texts sharing vocabulary land close
/// together, which is enough for lexical-leaning retrieval without a model.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dims: usize,
}

impl HashedEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHED_DIMS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashedEmbedder {
    fn model_name(&self) -> &str {
        "hashed"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

/// Lowercase alphanumeric tokens. Shared with the keyword side of the
/// in-memory store so both halves of hybrid search agree on terms.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (`POST /v1/embeddings`).
///
/// Requires the `OPENAI_API_KEY` environment variable. `embedding.url`
/// overrides the base URL for compatible servers.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Validation("embedding.model required for OpenAI provider".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Validation("OPENAI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims.unwrap_or(1536),
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/embeddings", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = send_with_retry("openai", request, self.max_retries).await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding` arrays, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::provider("openai", "invalid response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::provider("openai", "invalid response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, json_floats(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance (`POST /api/embed`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Validation("embedding.model required for Ollama provider".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims.unwrap_or(768),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body);
        let json = send_with_retry("ollama", request, self.max_retries)
            .await
            .map_err(|e| match e {
                Error::Provider { provider, message } => Error::Provider {
                    provider,
                    message: format!("{message} (is Ollama running at {}?)", self.url),
                },
                other => other,
            })?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| Error::provider("ollama", "invalid response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|a| json_floats(a))
                .ok_or_else(|| Error::provider("ollama", "invalid response: embedding is not an array"))
        })
        .collect()
}

fn json_floats(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Wait before retry number `retry` (1-based): 1s, 2s, 4s, ... up to 32s.
fn backoff(retry: u32) -> Duration {
    Duration::from_secs(1u64 << retry.saturating_sub(1).min(5))
}

enum Attempt {
    Done(serde_json::Value),
    Transient(Error),
}

async fn attempt_once(provider: &str, request: reqwest::RequestBuilder) -> Result<Attempt> {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return Ok(Attempt::Transient(Error::provider(
                provider,
                format!("connection error: {e}"),
            )))
        }
    };

    let status = response.status();
    if status.is_success() {
        return Ok(Attempt::Done(response.json().await?));
    }
    let detail = response.text().await.unwrap_or_default();
    let err = Error::provider(provider, format!("HTTP {status}: {detail}"));
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Ok(Attempt::Transient(err))
    } else {
        Err(err)
    }
}

/// Send `request`, retrying transient failures with [`backoff`].
async fn send_with_retry(
    provider: &str,
    request: reqwest::RequestBuilder,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut retry = 0;
    loop {
        let req = request
            .try_clone()
            .ok_or_else(|| Error::provider(provider, "request body is not cloneable"))?;
        match attempt_once(provider, req).await? {
            Attempt::Done(json) => return Ok(json),
            Attempt::Transient(err) if retry >= max_retries => return Err(err),
            Attempt::Transient(err) => {
                retry += 1;
                warn!(provider, retry, error = %err, "embedding request failed, retrying");
                tokio::time::sleep(backoff(retry)).await;
            }
        }
    }
}

// ============ Local Provider (fastembed) ============

/// Runs a fastembed model in-process. The model is downloaded on first use
/// and kept loaded for the life of the provider.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // Fail fast on unknown names.
        config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => Err(Error::Validation(format!(
            "unknown local embedding model '{other}'"
        ))),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let slot = Arc::clone(&self.model);
        let model_name = self.model_name.clone();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| Error::provider("local", "model lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(config_to_fastembed_model(&model_name)?)
                        .with_show_download_progress(true),
                )
                .map_err(|e| Error::provider("local", format!("model init failed: {e}")))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| Error::provider("local", "model not loaded"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| Error::provider("local", e))
        })
        .await
        .map_err(|e| Error::provider("local", e))?
    }
}

/// Create the [`EmbeddingProvider`] named by `embedding.provider`.
///
/// Accepted names: `hashed`, `openai`, `ollama`, and `local` (the last only
/// when built with `local-embeddings-fastembed`).
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashed" => Ok(Arc::new(HashedEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASHED_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(Error::Validation(
            "local embedding provider requires --features local-embeddings-fastembed".into(),
        )),
        other => Err(Error::Validation(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(d, x2, y2), (x, y)| {
            (d + x * y, x2 + x * x, y2 + y * y)
        });
    let denom = (aa * bb).sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}
