//! Cross-encoder reranking with provider fallback.
//!
//! A shortlist of search results can be re-ordered by a cross-encoder
//! scoring `(query, text)` pairs jointly. Three providers:
//!
//! - **`cloud_rerank`** — hosted reranker endpoint (`COHERE_API_KEY`);
//!   each successful call records a per-request cost row.
//! - **`local_rerank`** — on-host fastembed cross-encoder
//!   (bge-reranker-base), lazily initialized once and shared.
//! - **`none`** — pass-through.
//!
//! Degradation chain: a selected cloud provider without a usable
//! credential becomes `local_rerank`; a failed cloud call falls back to
//! `local_rerank`; a failed local rerank returns the input annotated as
//! pass-through. Budget fallback mode forces `local_rerank` regardless of
//! per-call overrides.

#[cfg(feature = "local-models")]
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::config::RerankConfig;
use crate::costs::{CostTracker, Usage};
use crate::error::{Error, Result};
use crate::models::{CostOperation, SearchResult};

/// Hard cap on candidates sent to any provider.
pub const MAX_CANDIDATES_CAP: usize = 50;

const CLOUD_RERANK_MODEL: &str = "rerank-v3.5";
const CLOUD_RERANK_ENDPOINT: &str = "https://api.cohere.com/v2/rerank";

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RerankOptions {
    pub provider: Option<String>,
    pub top_k: Option<usize>,
    pub max_candidates: Option<usize>,
}

#[derive(Clone)]
pub struct Reranker {
    config: RerankConfig,
    costs: CostTracker,
    http: reqwest::Client,
    #[cfg(feature = "local-models")]
    local_model: Arc<Mutex<Option<fastembed::TextRerank>>>,
}

impl Reranker {
    pub fn new(config: RerankConfig, costs: CostTracker) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Rerank(format!("http client: {}", e)))?;
        Ok(Self {
            config,
            costs,
            http,
            #[cfg(feature = "local-models")]
            local_model: Arc::new(Mutex::new(None)),
        })
    }

    /// Resolve the provider for a call: budget fallback first, then call
    /// override, environment override, configured default. A cloud
    /// selection without a credential degrades to local.
    pub fn select_provider(&self, call_override: Option<&str>) -> &'static str {
        if self.costs.overrides().fallback_active() {
            return "local_rerank";
        }

        let selected = call_override
            .or(self.config.provider_override.as_deref())
            .unwrap_or(self.config.provider.as_str());

        match selected {
            "cloud_rerank" => {
                if cloud_credential().is_some() {
                    "cloud_rerank"
                } else {
                    warn!("cloud_rerank selected but credential missing; using local_rerank");
                    "local_rerank"
                }
            }
            "local_rerank" => "local_rerank",
            _ => "none",
        }
    }

    /// Rerank a shortlist. Never fails outright: every failure path
    /// degrades toward pass-through with finite scores.
    pub async fn rerank(
        &self,
        query: &str,
        results: Vec<SearchResult>,
        opts: &RerankOptions,
    ) -> Result<Vec<SearchResult>> {
        if results.is_empty() {
            return Ok(results);
        }

        let max_candidates = opts
            .max_candidates
            .unwrap_or(self.config.max_candidates)
            .min(MAX_CANDIDATES_CAP);
        let top_k = opts
            .top_k
            .unwrap_or(self.config.default_top_k)
            .min(results.len());

        let mut candidates = results;
        candidates.truncate(max_candidates.max(1));

        let provider = self.select_provider(opts.provider.as_deref());
        if provider == "none" {
            let mut out = pass_through(candidates);
            out.truncate(top_k);
            return Ok(out);
        }

        let scores = match provider {
            "cloud_rerank" => match self.rerank_cloud(query, &candidates).await {
                Ok(scores) => Some(("cloud_rerank", scores)),
                Err(e) => {
                    warn!(error = %e, "cloud rerank failed; trying local");
                    match self.rerank_local(query, &candidates).await {
                        Ok(scores) => Some(("local_rerank", scores)),
                        Err(e) => {
                            warn!(error = %e, "local rerank failed; passing through");
                            None
                        }
                    }
                }
            },
            _ => match self.rerank_local(query, &candidates).await {
                Ok(scores) => Some(("local_rerank", scores)),
                Err(e) => {
                    warn!(error = %e, "local rerank failed; passing through");
                    None
                }
            },
        };

        let mut out = match scores {
            Some((provider_id, scores)) => {
                let mut scored: Vec<SearchResult> = candidates
                    .into_iter()
                    .zip(scores.into_iter())
                    .map(|(mut r, score)| {
                        r.original_similarity = Some(r.similarity);
                        r.rerank_score = Some(score);
                        r.rerank_provider = Some(provider_id.to_string());
                        r
                    })
                    .collect();
                scored.sort_by(|a, b| {
                    b.rerank_score
                        .partial_cmp(&a.rerank_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                scored
            }
            None => pass_through(candidates),
        };

        out.truncate(top_k);
        Ok(out)
    }

    /// Call the hosted reranker. One cost row per successful request.
    async fn rerank_cloud(&self, query: &str, candidates: &[SearchResult]) -> Result<Vec<f64>> {
        let api_key = cloud_credential()
            .ok_or_else(|| Error::Rerank("COHERE_API_KEY not set".to_string()))?;

        let documents: Vec<&str> = candidates.iter().map(|r| r.text.as_str()).collect();
        let body = serde_json::json!({
            "model": CLOUD_RERANK_MODEL,
            "query": query,
            "documents": documents,
            "top_n": documents.len(),
        });

        let response = self
            .http
            .post(CLOUD_RERANK_ENDPOINT)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Rerank(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Rerank(format!("cloud reranker returned {}", status)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Rerank(e.to_string()))?;

        let ranked = json
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| Error::Rerank("invalid rerank response".to_string()))?;

        let mut scores = vec![0.0f64; candidates.len()];
        for item in ranked {
            let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(u64::MAX) as usize;
            let score = item
                .get("relevance_score")
                .and_then(|s| s.as_f64())
                .unwrap_or(0.0);
            if index < scores.len() {
                scores[index] = score;
            }
        }

        // Per-request pricing; token accounting is nominal.
        self.costs.track(Usage {
            provider: "cloud_rerank".to_string(),
            operation: CostOperation::Rerank,
            tokens: 1,
            model: CLOUD_RERANK_MODEL.to_string(),
            collection_id: None,
        });

        Ok(scores)
    }

    /// Score pairs with the shared local cross-encoder, initialized on
    /// first use.
    #[cfg(feature = "local-models")]
    async fn rerank_local(&self, query: &str, candidates: &[SearchResult]) -> Result<Vec<f64>> {
        let model_slot = self.local_model.clone();
        let query = query.to_string();
        let texts: Vec<String> = candidates.iter().map(|r| r.text.clone()).collect();
        let batch_size = self.config.batch_size.max(1);

        tokio::task::spawn_blocking(move || {
            let mut slot = model_slot.lock().expect("rerank model mutex poisoned");
            if slot.is_none() {
                let model = fastembed::TextRerank::try_new(fastembed::RerankInitOptions::new(
                    fastembed::RerankerModel::BGERerankerBase,
                ))
                .map_err(|e| Error::Rerank(format!("local reranker init: {}", e)))?;
                *slot = Some(model);
            }

            let refs: Vec<&String> = texts.iter().collect();
            let ranked = slot
                .as_mut()
                .expect("just initialized")
                .rerank(&query, refs, false, Some(batch_size))
                .map_err(|e| Error::Rerank(format!("local rerank: {}", e)))?;

            let mut scores = vec![0.0f64; texts.len()];
            for item in ranked {
                if item.index < scores.len() {
                    scores[item.index] = item.score as f64;
                }
            }
            Ok(scores)
        })
        .await
        .map_err(|e| Error::Rerank(format!("local rerank task: {}", e)))?
    }

    #[cfg(not(feature = "local-models"))]
    async fn rerank_local(&self, _query: &str, _candidates: &[SearchResult]) -> Result<Vec<f64>> {
        Err(Error::Rerank(
            "local reranking requires the local-models feature".to_string(),
        ))
    }
}

fn cloud_credential() -> Option<String> {
    std::env::var("COHERE_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
}

/// Annotate results without reordering: rerank score mirrors similarity
/// and the provider is reported as `none`.
fn pass_through(results: Vec<SearchResult>) -> Vec<SearchResult> {
    results
        .into_iter()
        .map(|mut r| {
            r.original_similarity = Some(r.similarity);
            r.rerank_score = Some(r.similarity);
            r.rerank_provider = Some("none".to_string());
            r
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::costs::RuntimeOverrides;
    use crate::db;
    use crate::migrate;
    use crate::models::{Citation, Metadata};
    use crate::store::Store;

    async fn reranker_with(config: RerankConfig) -> Reranker {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let costs = CostTracker::new(
            Store::new(pool),
            BudgetConfig::default(),
            RuntimeOverrides::new(),
        );
        Reranker::new(config, costs).unwrap()
    }

    fn result(chunk_id: i64, similarity: f64) -> SearchResult {
        SearchResult {
            chunk_id,
            text: format!("text {}", chunk_id),
            similarity,
            document_id: "doc".to_string(),
            doc_title: "Doc".to_string(),
            source_url: None,
            metadata: Metadata::default(),
            citation: Citation {
                title: "Doc".to_string(),
                page: None,
                section: None,
            },
            vector_score: None,
            bm25_score: None,
            fused_score: None,
            source: None,
            trust_weight: None,
            recency_weight: None,
            base_similarity: None,
            rerank_score: None,
            rerank_provider: None,
            original_similarity: None,
        }
    }

    #[tokio::test]
    async fn none_provider_passes_through_with_annotations() {
        let reranker = reranker_with(RerankConfig::default()).await;
        let results = vec![result(1, 0.9), result(2, 0.7)];

        let out = reranker
            .rerank("query", results, &RerankOptions::default())
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        // Order preserved, scores finite, provider reported as none.
        assert_eq!(out[0].chunk_id, 1);
        assert_eq!(out[0].rerank_score, Some(0.9));
        assert_eq!(out[0].rerank_provider.as_deref(), Some("none"));
        assert_eq!(out[0].original_similarity, Some(0.9));
    }

    #[tokio::test]
    async fn top_k_bounded_by_input_length() {
        let reranker = reranker_with(RerankConfig::default()).await;
        let results = vec![result(1, 0.9)];

        let opts = RerankOptions {
            top_k: Some(10),
            ..Default::default()
        };
        let out = reranker.rerank("query", results, &opts).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn max_candidates_hard_capped() {
        let reranker = reranker_with(RerankConfig::default()).await;
        let results: Vec<SearchResult> = (0..80).map(|i| result(i, 0.5)).collect();

        let opts = RerankOptions {
            max_candidates: Some(500),
            top_k: Some(80),
            ..Default::default()
        };
        let out = reranker.rerank("query", results, &opts).await.unwrap();
        assert!(out.len() <= MAX_CANDIDATES_CAP);
    }

    #[tokio::test]
    async fn fallback_mode_forces_local() {
        let reranker = reranker_with(RerankConfig {
            provider: "cloud_rerank".to_string(),
            ..Default::default()
        })
        .await;
        reranker.costs.overrides().enable_fallback();

        assert_eq!(reranker.select_provider(Some("cloud_rerank")), "local_rerank");
    }

    #[tokio::test]
    async fn call_override_beats_config() {
        let reranker = reranker_with(RerankConfig::default()).await;
        assert_eq!(reranker.select_provider(Some("local_rerank")), "local_rerank");
        assert_eq!(reranker.select_provider(None), "none");
    }

    #[tokio::test]
    async fn missing_cloud_credential_degrades_to_local() {
        // The test environment has no COHERE_API_KEY.
        std::env::remove_var("COHERE_API_KEY");
        let reranker = reranker_with(RerankConfig {
            provider: "cloud_rerank".to_string(),
            ..Default::default()
        })
        .await;
        assert_eq!(reranker.select_provider(None), "local_rerank");
    }
}
