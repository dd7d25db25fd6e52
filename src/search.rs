//! Search engine: vector, BM25, and hybrid retrieval.
//!
//! - **Vector** — embeds the query with the collection's declared provider
//!   and scans cosine similarity over the collection's chunks.
//! - **BM25** — prefix-expanded full-text query against the FTS index,
//!   scores normalized into (0, 1] within the response.
//! - **Hybrid** — runs both legs in parallel over an expanded candidate
//!   set and fuses them with weighted Reciprocal Rank Fusion:
//!   a result at 0-based rank `i` from source `s` contributes
//!   `weight_s / (rrf_k + i + 1)`; contributions sum per chunk.
//!
//! Responses are deterministic for a fixed database snapshot: ordering is
//! by score descending with a stable tie-break on insertion order.

use std::collections::HashMap;

use crate::embedding::EmbeddingRouter;
use crate::error::{Error, Result};
use crate::models::{FusionSource, SearchResult};
use crate::store::Store;

/// Default result count for vector search.
pub const DEFAULT_VECTOR_TOP_K: usize = 5;
/// Default candidate count for BM25 search.
pub const DEFAULT_BM25_TOP_K: usize = 30;
/// Default result count for hybrid search.
pub const DEFAULT_HYBRID_TOP_K: usize = 10;

/// Caller-facing parameters for hybrid search.
#[derive(Debug, Clone, Default)]
pub struct HybridParams {
    pub top_k: Option<usize>,
    pub min_similarity: Option<f64>,
    pub weights: Option<(f64, f64)>,
    pub rrf_k: Option<f64>,
    pub provider_override: Option<String>,
}

/// Hybrid search outcome with per-leg counts for response metadata.
#[derive(Debug, Clone)]
pub struct HybridOutcome {
    pub results: Vec<SearchResult>,
    pub vector_count: usize,
    pub bm25_count: usize,
    pub fused_count: usize,
    pub embedding_provider: String,
}

#[derive(Clone)]
pub struct SearchEngine {
    store: Store,
    router: EmbeddingRouter,
    config: crate::config::SearchConfig,
}

impl SearchEngine {
    pub fn new(store: Store, router: EmbeddingRouter, config: crate::config::SearchConfig) -> Self {
        Self {
            store,
            router,
            config,
        }
    }

    /// Pure vector search over one collection.
    pub async fn vector_search(
        &self,
        query: &str,
        collection_id: &str,
        top_k: i64,
        min_similarity: Option<f64>,
        provider_override: Option<&str>,
    ) -> Result<(Vec<SearchResult>, String)> {
        if query.trim().is_empty() {
            return Err(Error::EmptyQuery);
        }
        if top_k <= 0 {
            return Err(Error::InvalidTopK(top_k));
        }
        self.store.get_collection(collection_id).await?;

        // Match the query vector to the collection's chunk vectors.
        let declared = self
            .store
            .collection_embedding_identity(collection_id)
            .await?
            .map(|(provider, _)| provider);
        let provider = provider_override
            .map(str::to_string)
            .or(declared);

        let embedded = self
            .router
            .embed(query, None, provider.as_deref())
            .await?;

        let min_similarity = min_similarity.unwrap_or(self.config.min_similarity);
        let mut results = self
            .store
            .vector_query(collection_id, &embedded.vector, top_k as usize, min_similarity)
            .await?;

        for r in &mut results {
            r.vector_score = Some(r.similarity);
        }
        Ok((results, embedded.provider_id))
    }

    /// BM25 full-text search over one collection.
    ///
    /// The query is stripped of reserved operator characters and each
    /// remaining term is prefix-expanded and AND-combined. Scores are the
    /// raw rank divided by the best rank in the response, so they fall in
    /// (0, 1].
    pub async fn bm25_search(
        &self,
        query: &str,
        collection_id: &str,
        top_k: i64,
        _language: &str,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(Error::EmptyQuery);
        }
        if top_k <= 0 {
            return Err(Error::InvalidTopK(top_k));
        }

        let match_expr = build_match_expression(query).ok_or(Error::TermlessQuery)?;

        let candidates = self
            .store
            .fts_query(collection_id, &match_expr, top_k as usize)
            .await?;

        let max_raw = candidates
            .iter()
            .map(|c| c.raw_rank)
            .fold(f64::NEG_INFINITY, f64::max)
            .max(1.0);

        Ok(candidates
            .into_iter()
            .map(|c| {
                let mut result = c.result;
                result.bm25_score = Some(c.raw_rank / max_raw);
                result
            })
            .collect())
    }

    /// Hybrid search: parallel vector + BM25 legs fused with weighted RRF.
    pub async fn hybrid_search(
        &self,
        query: &str,
        collection_id: &str,
        params: &HybridParams,
    ) -> Result<HybridOutcome> {
        if query.trim().is_empty() {
            return Err(Error::EmptyQuery);
        }
        let top_k = params.top_k.unwrap_or(DEFAULT_HYBRID_TOP_K);
        if top_k == 0 {
            return Err(Error::InvalidTopK(0));
        }

        // Expand candidates before fusion so RRF has room to reorder.
        let fetch_k = (top_k * 3).max(top_k) as i64;

        let vector_fut = self.vector_search(
            query,
            collection_id,
            fetch_k,
            params.min_similarity,
            params.provider_override.as_deref(),
        );
        let bm25_fut = self.bm25_search(query, collection_id, fetch_k, &self.config.fts_language);

        let (vector_leg, bm25_leg) = tokio::join!(vector_fut, bm25_fut);
        let (vector_results, embedding_provider) = vector_leg?;
        // A query with no lexical tokens still has a vector leg.
        let bm25_results = match bm25_leg {
            Ok(results) => results,
            Err(Error::TermlessQuery) => Vec::new(),
            Err(e) => return Err(e),
        };

        let weights = resolve_weights(
            params.weights,
            (self.config.vector_weight, self.config.bm25_weight),
        );
        let rrf_k = params.rrf_k.unwrap_or(self.config.rrf_k);

        let vector_count = vector_results.len();
        let bm25_count = bm25_results.len();
        let mut fused = fuse(vector_results, bm25_results, weights, rrf_k);
        let fused_count = fused.len();
        fused.truncate(top_k);

        Ok(HybridOutcome {
            results: fused,
            vector_count,
            bm25_count,
            fused_count,
            embedding_provider,
        })
    }
}

/// Build an FTS match expression: reserved operators stripped, terms
/// prefix-expanded and AND-combined. `None` when nothing searchable
/// remains.
pub fn build_match_expression(query: &str) -> Option<String> {
    let cleaned: String = query
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let terms: Vec<String> = cleaned
        .split_whitespace()
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" AND "))
    }
}

/// Resolve fusion weights: caller values override configured defaults;
/// both must be positive and finite or the defaults are restored. The
/// winning pair is normalized by its sum.
pub fn resolve_weights(caller: Option<(f64, f64)>, defaults: (f64, f64)) -> (f64, f64) {
    let valid = |(v, b): (f64, f64)| v.is_finite() && b.is_finite() && v > 0.0 && b > 0.0;

    let (v, b) = match caller {
        Some(pair) if valid(pair) => pair,
        _ if valid(defaults) => defaults,
        _ => (0.7, 0.3),
    };

    let sum = v + b;
    (v / sum, b / sum)
}

/// Weighted Reciprocal Rank Fusion of the two result lists.
///
/// Output order is fused score descending with insertion order (vector
/// leg first) as the stable tie-break.
pub fn fuse(
    vector: Vec<SearchResult>,
    bm25: Vec<SearchResult>,
    (w_vec, w_bm25): (f64, f64),
    rrf_k: f64,
) -> Vec<SearchResult> {
    struct Entry {
        result: SearchResult,
        fused: f64,
        in_vector: bool,
        in_bm25: bool,
        insertion: usize,
    }

    let mut order: Vec<i64> = Vec::new();
    let mut entries: HashMap<i64, Entry> = HashMap::new();

    for (i, mut result) in vector.into_iter().enumerate() {
        let contribution = w_vec / (rrf_k + i as f64 + 1.0);
        result.vector_score = result.vector_score.or(Some(result.similarity));
        let insertion = order.len();
        order.push(result.chunk_id);
        entries.insert(
            result.chunk_id,
            Entry {
                result,
                fused: contribution,
                in_vector: true,
                in_bm25: false,
                insertion,
            },
        );
    }

    for (i, result) in bm25.into_iter().enumerate() {
        let contribution = w_bm25 / (rrf_k + i as f64 + 1.0);
        match entries.get_mut(&result.chunk_id) {
            Some(entry) => {
                entry.fused += contribution;
                entry.in_bm25 = true;
                entry.result.bm25_score = result.bm25_score;
            }
            None => {
                let insertion = order.len();
                order.push(result.chunk_id);
                entries.insert(
                    result.chunk_id,
                    Entry {
                        result,
                        fused: contribution,
                        in_vector: false,
                        in_bm25: true,
                        insertion,
                    },
                );
            }
        }
    }

    let mut merged: Vec<Entry> = order
        .into_iter()
        .filter_map(|id| entries.remove(&id))
        .collect();

    merged.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.insertion.cmp(&b.insertion))
    });

    merged
        .into_iter()
        .map(|entry| {
            let mut result = entry.result;
            result.fused_score = Some(entry.fused);
            result.source = Some(match (entry.in_vector, entry.in_bm25) {
                (true, true) => FusionSource::Both,
                (true, false) => FusionSource::Vector,
                (false, _) => FusionSource::Bm25,
            });
            result
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Citation, Metadata};

    fn result(chunk_id: i64, similarity: f64) -> SearchResult {
        SearchResult {
            chunk_id,
            text: format!("chunk {}", chunk_id),
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

    #[test]
    fn match_expression_strips_operators() {
        assert_eq!(
            build_match_expression("setup authentication").as_deref(),
            Some(r#""setup"* AND "authentication"*"#)
        );
        assert_eq!(
            build_match_expression(r#"a:b (c) "d" -e"#).as_deref(),
            Some(r#""a"* AND "b"* AND "c"* AND "d"* AND "e"*"#)
        );
        assert!(build_match_expression("  \"*()  ").is_none());
        assert!(build_match_expression("").is_none());
    }

    #[test]
    fn weight_resolution_and_normalization() {
        // Caller weights normalized by sum
        assert_eq!(resolve_weights(Some((1.0, 1.0)), (0.7, 0.3)), (0.5, 0.5));

        // Invalid caller weights fall back to defaults, normalized
        let (v, b) = resolve_weights(Some((-1.0, 0.3)), (0.7, 0.3));
        assert!((v - 0.7).abs() < 1e-9);
        assert!((b - 0.3).abs() < 1e-9);

        let (v, b) = resolve_weights(Some((f64::NAN, 0.3)), (0.7, 0.3));
        assert!((v - 0.7).abs() < 1e-9 && (b - 0.3).abs() < 1e-9);

        // Broken defaults reset to the canonical pair
        let (v, b) = resolve_weights(None, (0.0, 0.0));
        assert!((v - 0.7).abs() < 1e-9 && (b - 0.3).abs() < 1e-9);
    }

    #[test]
    fn rrf_contribution_formula() {
        // Chunk 1 is rank 0 in both legs: fused = 0.7/61 + 0.3/61 = 1/61
        let fused = fuse(
            vec![result(1, 0.9)],
            vec![result(1, 0.0)],
            (0.7, 0.3),
            60.0,
        );
        assert_eq!(fused.len(), 1);
        let expected = 1.0 / 61.0;
        assert!((fused[0].fused_score.unwrap() - expected).abs() < 1e-9);
        assert_eq!(fused[0].source, Some(FusionSource::Both));
    }

    #[test]
    fn single_leg_results_keep_their_source() {
        let fused = fuse(
            vec![result(1, 0.9)],
            vec![result(2, 0.0)],
            (0.7, 0.3),
            60.0,
        );
        assert_eq!(fused.len(), 2);

        let by_id: HashMap<i64, &SearchResult> =
            fused.iter().map(|r| (r.chunk_id, r)).collect();
        assert_eq!(by_id[&1].source, Some(FusionSource::Vector));
        assert_eq!(by_id[&2].source, Some(FusionSource::Bm25));

        // Vector weight dominates: 0.7/61 > 0.3/61
        assert_eq!(fused[0].chunk_id, 1);
    }

    #[test]
    fn fused_score_is_sum_of_per_leg_terms() {
        // chunk 1: vector rank 0, bm25 rank 1
        // chunk 2: vector rank 1, bm25 rank 0
        let fused = fuse(
            vec![result(1, 0.9), result(2, 0.8)],
            vec![result(2, 0.0), result(1, 0.0)],
            (0.7, 0.3),
            60.0,
        );

        let by_id: HashMap<i64, f64> = fused
            .iter()
            .map(|r| (r.chunk_id, r.fused_score.unwrap()))
            .collect();

        let expect_1 = 0.7 / 61.0 + 0.3 / 62.0;
        let expect_2 = 0.7 / 62.0 + 0.3 / 61.0;
        assert!((by_id[&1] - expect_1).abs() < 1e-12);
        assert!((by_id[&2] - expect_2).abs() < 1e-12);
        assert_eq!(fused[0].chunk_id, 1);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        // Two chunks, each only in one leg at the same rank with equal
        // weights: identical fused scores, vector-leg chunk first.
        let fused = fuse(
            vec![result(7, 0.9)],
            vec![result(8, 0.0)],
            (0.5, 0.5),
            60.0,
        );
        assert_eq!(fused[0].chunk_id, 7);
        assert_eq!(fused[1].chunk_id, 8);
        assert_eq!(fused[0].fused_score, fused[1].fused_score);
    }
}
