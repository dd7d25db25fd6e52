//! Embedding provider registry, router, and vector utilities.
//!
//! Three providers are registered:
//! - **`local`** — on-host fastembed model (bge-base-en-v1.5, 768 dims); no
//!   network calls after the model download, and the free tier every cloud
//!   failure falls back to.
//! - **`general_cloud`** — OpenAI-style embeddings endpoint
//!   (text-embedding-3-small, 1536 dims), keyed by `OPENAI_API_KEY`.
//! - **`code_cloud`** — Voyage-style endpoint specialized for source code
//!   (voyage-code-3, 1024 dims), keyed by `VOYAGE_API_KEY`.
//!
//! Selection order: budget fallback mode, then explicit override, then the
//! caller's declared content type, then a code-pattern heuristic over the
//! text, then `local`. Cloud calls retry transient failures with
//! exponential backoff and record a cost row per call; on terminal cloud
//! failure the router degrades to `local` and still returns a vector.
//!
//! Vector utilities: [`vec_to_blob`] / [`blob_to_vec`] encode embeddings as
//! little-endian `f32` BLOBs for SQLite storage; [`cosine_similarity`] is
//! the similarity metric used across search and synthesis.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::costs::{CostTracker, Usage};
use crate::error::{Error, Result};
use crate::models::CostOperation;

/// Upper bound on cached content-hash → vector entries.
const CACHE_MAX_ENTRIES: usize = 10_000;

/// A registered embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSpec {
    pub id: &'static str,
    pub model: &'static str,
    pub dims: usize,
}

pub const LOCAL: ProviderSpec = ProviderSpec {
    id: "local",
    model: "bge-base-en-v1.5",
    dims: 768,
};

pub const GENERAL_CLOUD: ProviderSpec = ProviderSpec {
    id: "general_cloud",
    model: "text-embedding-3-small",
    dims: 1536,
};

pub const CODE_CLOUD: ProviderSpec = ProviderSpec {
    id: "code_cloud",
    model: "voyage-code-3",
    dims: 1024,
};

/// Look up a provider by id.
pub fn provider_by_id(id: &str) -> Option<&'static ProviderSpec> {
    match id {
        "local" => Some(&LOCAL),
        "general_cloud" => Some(&GENERAL_CLOUD),
        "code_cloud" => Some(&CODE_CLOUD),
        _ => None,
    }
}

/// Declared content kind for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Code,
    Docs,
    Personal,
}

/// Optional routing context supplied by callers.
#[derive(Debug, Clone, Default)]
pub struct ContentContext {
    pub kind: Option<ContentKind>,
    pub language: Option<String>,
    pub collection_id: Option<String>,
}

/// An embedding plus the identity of the model that produced it.
#[derive(Debug, Clone)]
pub struct Embedded {
    pub vector: Vec<f32>,
    pub provider_id: String,
    pub model_id: String,
    pub dimensions: usize,
}

/// Routes embedding requests to the appropriate provider.
#[derive(Clone)]
pub struct EmbeddingRouter {
    config: EmbeddingConfig,
    costs: CostTracker,
    http: reqwest::Client,
    cache: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    #[cfg(feature = "local-models")]
    local_model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

impl EmbeddingRouter {
    pub fn new(config: EmbeddingConfig, costs: CostTracker) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Embedding(format!("http client: {}", e)))?;

        Ok(Self {
            config,
            costs,
            http,
            cache: Arc::new(Mutex::new(HashMap::new())),
            #[cfg(feature = "local-models")]
            local_model: Arc::new(Mutex::new(None)),
        })
    }

    /// Pick the provider for a text without embedding it.
    ///
    /// Fallback mode wins over everything, including explicit overrides;
    /// after that: call override, configured env override, declared content
    /// kind, code heuristic, `local`.
    pub fn select_provider(
        &self,
        text: &str,
        context: Option<&ContentContext>,
        override_id: Option<&str>,
    ) -> &'static ProviderSpec {
        if self.costs.overrides().fallback_active() {
            return &LOCAL;
        }

        if let Some(spec) = override_id.and_then(provider_by_id) {
            return spec;
        }
        if let Some(spec) = self
            .config
            .provider_override
            .as_deref()
            .and_then(provider_by_id)
        {
            return spec;
        }

        let by_kind = |kind: ContentKind| -> &'static ProviderSpec {
            let configured = match kind {
                ContentKind::Code => self.config.code_provider.as_str(),
                ContentKind::Personal => self.config.writing_provider.as_str(),
                ContentKind::Docs => self.config.docs_provider.as_str(),
            };
            provider_by_id(configured).unwrap_or(&LOCAL)
        };

        if let Some(kind) = context.and_then(|c| c.kind) {
            return by_kind(kind);
        }

        if looks_like_code(text) {
            return by_kind(ContentKind::Code);
        }

        &LOCAL
    }

    /// Embed one text. Never fails on cloud outages: the router falls back
    /// to `local` and only errors when even the local model fails.
    pub async fn embed(
        &self,
        text: &str,
        context: Option<&ContentContext>,
        override_id: Option<&str>,
    ) -> Result<Embedded> {
        let texts = [text.to_string()];
        let batch = self.embed_batch(&texts, context, override_id).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("empty embedding response".to_string()))
    }

    /// Embed a batch of texts with one provider decision for the whole
    /// batch (routed on the first text). Identical texts hit the in-process
    /// cache instead of the provider.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        context: Option<&ContentContext>,
        override_id: Option<&str>,
    ) -> Result<Vec<Embedded>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let spec = self.select_provider(&texts[0], context, override_id);
        let collection_id = context.and_then(|c| c.collection_id.clone());

        // Resolve cache hits up front; only misses go to the provider.
        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<usize> = Vec::new();
        {
            let cache = self.cache.lock().expect("embedding cache poisoned");
            for (i, text) in texts.iter().enumerate() {
                match cache.get(&cache_key(spec.id, text)) {
                    Some(v) => vectors.push(Some(v.clone())),
                    None => {
                        vectors.push(None);
                        misses.push(i);
                    }
                }
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let (embedded, actual_spec) = self
                .embed_with_fallback(spec, &miss_texts, collection_id.as_deref())
                .await?;

            // A mid-batch degrade to local would mix dimensions with any
            // cache hits from the original provider; re-embed the whole
            // batch with the provider that actually answered.
            let (embedded, covered) = if actual_spec.id != spec.id && misses.len() != texts.len() {
                (self.embed_local(texts).await?, None)
            } else {
                (embedded, Some(&misses))
            };

            let mut cache = self.cache.lock().expect("embedding cache poisoned");
            if cache.len() > CACHE_MAX_ENTRIES {
                cache.clear();
            }
            match covered {
                Some(miss_idx) => {
                    for (&i, vec) in miss_idx.iter().zip(embedded.iter()) {
                        cache.insert(cache_key(actual_spec.id, &texts[i]), vec.clone());
                        vectors[i] = Some(vec.clone());
                    }
                }
                None => {
                    for (i, vec) in embedded.iter().enumerate() {
                        cache.insert(cache_key(actual_spec.id, &texts[i]), vec.clone());
                        vectors[i] = Some(vec.clone());
                    }
                }
            }

            return Ok(vectors
                .into_iter()
                .map(|v| Embedded {
                    vector: v.expect("all vectors resolved"),
                    provider_id: actual_spec.id.to_string(),
                    model_id: actual_spec.model.to_string(),
                    dimensions: actual_spec.dims,
                })
                .collect());
        }

        Ok(vectors
            .into_iter()
            .map(|v| Embedded {
                vector: v.expect("all vectors cached"),
                provider_id: spec.id.to_string(),
                model_id: spec.model.to_string(),
                dimensions: spec.dims,
            })
            .collect())
    }

    /// Call the selected provider; on terminal cloud failure, log and
    /// degrade to local. Returns the vectors and the provider that
    /// actually produced them.
    async fn embed_with_fallback(
        &self,
        spec: &'static ProviderSpec,
        texts: &[String],
        collection_id: Option<&str>,
    ) -> Result<(Vec<Vec<f32>>, &'static ProviderSpec)> {
        match spec.id {
            "local" => Ok((self.embed_local(texts).await?, &LOCAL)),
            _ => match self.embed_cloud(spec, texts, collection_id).await {
                Ok(vectors) => Ok((vectors, spec)),
                Err(e) => {
                    warn!(provider = spec.id, error = %e, "cloud embedding failed; falling back to local");
                    Ok((self.embed_local(texts).await?, &LOCAL))
                }
            },
        }
    }

    /// Call a cloud embeddings endpoint with retry/backoff.
    ///
    /// Retry strategy: HTTP 429 or 5xx and network errors retry with
    /// exponential backoff (1s, 2s, 4s, capped); other 4xx fail
    /// immediately.
    async fn embed_cloud(
        &self,
        spec: &'static ProviderSpec,
        texts: &[String],
        collection_id: Option<&str>,
    ) -> Result<Vec<Vec<f32>>> {
        let (endpoint, key_var) = match spec.id {
            "general_cloud" => ("https://api.openai.com/v1/embeddings", "OPENAI_API_KEY"),
            "code_cloud" => ("https://api.voyageai.com/v1/embeddings", "VOYAGE_API_KEY"),
            other => return Err(Error::Embedding(format!("unknown cloud provider: {}", other))),
        };
        let api_key = std::env::var(key_var)
            .map_err(|_| Error::Embedding(format!("{} not set", key_var)))?;

        let body = serde_json::json!({
            "model": spec.model,
            "input": texts,
        });

        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(endpoint)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| Error::Embedding(e.to_string()))?;
                        let vectors = parse_embeddings_response(&json)?;

                        let tokens: i64 = texts.iter().map(|t| (t.len() as i64 + 3) / 4).sum();
                        self.costs.track(Usage {
                            provider: spec.id.to_string(),
                            operation: CostOperation::Embed,
                            tokens,
                            model: spec.model.to_string(),
                            collection_id: collection_id.map(str::to_string),
                        });

                        return Ok(vectors);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::Embedding(format!(
                            "{} returned {}",
                            spec.id, status
                        )));
                        continue;
                    }

                    return Err(Error::Embedding(format!("{} returned {}", spec.id, status)));
                }
                Err(e) => {
                    last_err = Some(Error::Embedding(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Embedding("embedding failed after retries".to_string())))
    }

    /// Run the shared local model. The model is initialized once on first
    /// use and reused for the life of the process.
    #[cfg(feature = "local-models")]
    async fn embed_local(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model_slot = self.local_model.clone();
        let texts = texts.to_vec();
        let batch_size = self.config.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut slot = model_slot.lock().expect("local model mutex poisoned");
            if slot.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed::EmbeddingModel::BGEBaseENV15),
                )
                .map_err(|e| Error::Embedding(format!("local model init: {}", e)))?;
                *slot = Some(model);
            }
            slot.as_mut()
                .expect("just initialized")
                .embed(texts, Some(batch_size))
                .map_err(|e| Error::Embedding(format!("local embedding: {}", e)))
        })
        .await
        .map_err(|e| Error::Embedding(format!("local embedding task: {}", e)))?
    }

    #[cfg(not(feature = "local-models"))]
    async fn embed_local(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::Embedding(
            "local embedding requires the local-models feature".to_string(),
        ))
    }
}

fn cache_key(provider_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::Embedding("invalid response: missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::Embedding("invalid response: missing embedding".to_string()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

/// Heuristic: does this text look like source code?
///
/// Checks each line for module imports, declarations, const assignments,
/// generic-call syntax, line comments, and preprocessor includes.
pub fn looks_like_code(text: &str) -> bool {
    for line in text.lines().take(200) {
        let trimmed = line.trim_start();

        if trimmed.starts_with("import ")
            || trimmed.starts_with("from ") && trimmed.contains(" import ")
            || trimmed.starts_with("use ") && trimmed.contains("::")
            || trimmed.starts_with("#include")
        {
            return true;
        }

        if trimmed.starts_with("fn ")
            || trimmed.starts_with("function ")
            || trimmed.starts_with("class ")
            || trimmed.starts_with("enum ")
            || trimmed.starts_with("interface ")
            || trimmed.starts_with("def ")
        {
            return true;
        }

        if trimmed.starts_with("const ") && trimmed.contains('=') {
            return true;
        }

        if trimmed.starts_with("//") {
            return true;
        }

        // Generic-call syntax like `foo::<Bar>(..)` or `Vec<String>(`
        if trimmed.contains("::<") {
            return true;
        }
        if let Some(open) = trimmed.find('<') {
            if let Some(close_rel) = trimmed[open..].find('>') {
                let after = &trimmed[open + close_rel + 1..];
                if after.starts_with('(') {
                    return true;
                }
            }
        }
    }
    false
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
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

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty or
/// mismatched-length vectors.
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
