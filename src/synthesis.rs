//! Synthesis: cluster top search results into "approaches", score
//! consensus, and detect contradictions between approaches.
//!
//! Pipeline per request:
//! 1. take the first `max_results` results;
//! 2. embed each result's leading text (pseudo-embeddings on failure, so
//!    synthesis still answers when every provider is down);
//! 3. k-means cluster (cosine assignment, mean centroids, bounded
//!    iterations);
//! 4. build an approach per non-empty cluster with topic/method/summary
//!    drawn from result metadata;
//! 5. score consensus per cluster from source quality, centroid
//!    similarity, and freshness;
//! 6. run LLM contradiction detection over lexically-overlapping approach
//!    pairs;
//! 7. recommend the approach with the best conflict-penalized consensus.

use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SynthesisConfig;
use crate::costs::{CostTracker, RuntimeOverrides, Usage};
use crate::embedding::{cosine_similarity, EmbeddingRouter};
use crate::error::Result;
use crate::llm::{parse_first_json_block, LlmClient};
use crate::models::{CostOperation, SearchResult};
use crate::rescore::{months_between, parse_iso_date};

/// Characters of result text fed to the embedding provider.
const EMBED_PREFIX_CHARS: usize = 600;
/// Dimensionality of the deterministic pseudo-embedding fallback.
const PSEUDO_DIMS: usize = 64;
/// Maximum k-means iterations.
const KMEANS_MAX_ITERS: usize = 10;
/// Centroid movement below this ends iteration.
const KMEANS_TOLERANCE: f32 = 1e-4;
/// Summary length cap in characters.
const SUMMARY_MAX_CHARS: usize = 360;
/// Per-source snippet length cap in characters.
const SNIPPET_MAX_CHARS: usize = 420;

/// One cited source inside an approach.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApproachSource {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub snippet: String,
}

/// A coherent way to answer the query, backed by a cluster of results.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Approach {
    pub topic: String,
    pub method: String,
    pub summary: String,
    pub sources: Vec<ApproachSource>,
    pub consensus: f64,
}

/// A detected contradiction between two approaches.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Conflict {
    pub topic: String,
    pub severity: String,
    pub confidence: f64,
    pub description: String,
    pub source_a: String,
    pub source_b: String,
}

/// Full synthesis output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Synthesis {
    pub approaches: Vec<Approach>,
    pub conflicts: Vec<Conflict>,
    /// Index into `approaches`, when any exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended: Option<usize>,
    pub total_sources: usize,
    pub used_fallback_embeddings: bool,
}

#[derive(Clone)]
pub struct SynthesisEngine {
    router: EmbeddingRouter,
    llm: Arc<dyn LlmClient>,
    costs: CostTracker,
    overrides: Arc<RuntimeOverrides>,
    config: SynthesisConfig,
}

impl SynthesisEngine {
    pub fn new(
        router: EmbeddingRouter,
        llm: Arc<dyn LlmClient>,
        costs: CostTracker,
        config: SynthesisConfig,
    ) -> Self {
        let overrides = costs.overrides();
        Self {
            router,
            llm,
            costs,
            overrides,
            config,
        }
    }

    /// Synthesize approaches from ranked results.
    pub async fn synthesize(
        &self,
        query: &str,
        results: Vec<SearchResult>,
        cancel: &CancellationToken,
    ) -> Result<Synthesis> {
        let mut results = results;
        results.truncate(self.config.max_results);

        if results.is_empty() {
            return Ok(Synthesis {
                approaches: Vec::new(),
                conflicts: Vec::new(),
                recommended: None,
                total_sources: 0,
                used_fallback_embeddings: false,
            });
        }

        let (vectors, used_fallback) = self.embed_results(&results).await;

        let k = cluster_count(results.len());
        let (assignments, centroids) = kmeans(&vectors, k);

        let today = Utc::now().date_naive();
        let mut approaches: Vec<Approach> = Vec::new();
        for cluster in 0..k {
            let members: Vec<usize> = assignments
                .iter()
                .enumerate()
                .filter(|(_, &a)| a == cluster)
                .map(|(i, _)| i)
                .collect();
            if members.is_empty() {
                continue;
            }
            approaches.push(build_approach(
                query,
                &results,
                &members,
                &vectors,
                &centroids[cluster],
                today,
            ));
        }

        let conflicts = if self.contradiction_enabled() {
            self.detect_contradictions(&approaches, cancel).await
        } else {
            Vec::new()
        };

        let recommended = recommend(&approaches, &conflicts);

        Ok(Synthesis {
            total_sources: results.len(),
            approaches,
            conflicts,
            recommended,
            used_fallback_embeddings: used_fallback,
        })
    }

    /// Contradiction detection is governed by its flag and disabled
    /// process-wide by budget fallback mode.
    fn contradiction_enabled(&self) -> bool {
        self.config.contradiction_enabled && !self.overrides.fallback_active()
    }

    /// Embed the leading text of each result. If the router fails, every
    /// result gets a deterministic pseudo-embedding instead so clustering
    /// still proceeds.
    async fn embed_results(&self, results: &[SearchResult]) -> (Vec<Vec<f32>>, bool) {
        let texts: Vec<String> = results
            .iter()
            .map(|r| r.text.chars().take(EMBED_PREFIX_CHARS).collect())
            .collect();

        match self.router.embed_batch(&texts, None, None).await {
            Ok(embedded) => (embedded.into_iter().map(|e| e.vector).collect(), false),
            Err(e) => {
                warn!(error = %e, "synthesis embedding failed; using pseudo-embeddings");
                (texts.iter().map(|t| pseudo_embedding(t)).collect(), true)
            }
        }
    }

    /// Run the contradiction detector over candidate approach pairs.
    async fn detect_contradictions(
        &self,
        approaches: &[Approach],
        cancel: &CancellationToken,
    ) -> Vec<Conflict> {
        let pairs = select_pairs(
            approaches,
            self.config.min_overlap,
            self.config.max_overlap,
            self.config.max_pairs.min(6),
        );

        let mut conflicts = Vec::new();
        for (a, b) in pairs {
            if cancel.is_cancelled() {
                debug!("contradiction detection cancelled");
                break;
            }
            match self.check_pair(&approaches[a], &approaches[b], cancel).await {
                Some(conflict) => conflicts.push(conflict),
                None => continue,
            }
        }
        conflicts
    }

    /// Ask the LLM whether two approaches contradict each other. Any
    /// failure skips the pair.
    async fn check_pair(
        &self,
        a: &Approach,
        b: &Approach,
        cancel: &CancellationToken,
    ) -> Option<Conflict> {
        let prompt = contradiction_prompt(a, b);

        let text = match self.llm.complete(&prompt, cancel).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "contradiction check failed; skipping pair");
                return None;
            }
        };

        self.costs.track(Usage {
            provider: "anthropic".to_string(),
            operation: CostOperation::Generate,
            tokens: (prompt.len() as i64 + 3) / 4,
            model: self.llm.model().to_string(),
            collection_id: None,
        });

        let value = parse_first_json_block(&text)?;
        if value.get("contradiction").and_then(|v| v.as_bool()) != Some(true) {
            return None;
        }

        Some(conflict_from_json(&value, a, b))
    }
}

/// `k = max(1, min(3, ⌊n/3⌋ or 1))`.
pub fn cluster_count(n: usize) -> usize {
    let third = if n / 3 == 0 { 1 } else { n / 3 };
    third.min(3).max(1)
}

/// k-means with cosine-similarity assignment and mean centroids.
///
/// Initial centroids are the first `k` vectors. Iterates at most
/// [`KMEANS_MAX_ITERS`] rounds, stopping when every centroid coordinate
/// moves by less than [`KMEANS_TOLERANCE`]. Returns per-vector cluster
/// assignments and the final centroids.
pub fn kmeans(vectors: &[Vec<f32>], k: usize) -> (Vec<usize>, Vec<Vec<f32>>) {
    let n = vectors.len();
    if n == 0 || k == 0 {
        return (Vec::new(), Vec::new());
    }
    let k = k.min(n);
    let dims = vectors[0].len();

    let mut centroids: Vec<Vec<f32>> = vectors[..k].to_vec();
    let mut assignments = vec![0usize; n];

    for _ in 0..KMEANS_MAX_ITERS {
        // Assign by maximum cosine similarity.
        for (i, vec) in vectors.iter().enumerate() {
            let mut best = 0usize;
            let mut best_sim = f32::NEG_INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let sim = cosine_similarity(vec, centroid);
                if sim > best_sim {
                    best_sim = sim;
                    best = c;
                }
            }
            assignments[i] = best;
        }

        // Recompute centroids as component-wise means.
        let mut next: Vec<Vec<f32>> = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (i, vec) in vectors.iter().enumerate() {
            let c = assignments[i];
            counts[c] += 1;
            for (d, value) in vec.iter().enumerate() {
                next[c][d] += value;
            }
        }
        for (c, centroid) in next.iter_mut().enumerate() {
            if counts[c] == 0 {
                // Empty cluster keeps its previous centroid.
                *centroid = centroids[c].clone();
                continue;
            }
            for value in centroid.iter_mut() {
                *value /= counts[c] as f32;
            }
        }

        // Convergence: every coordinate of every centroid stable.
        let converged = centroids.iter().zip(next.iter()).all(|(old, new)| {
            old.iter()
                .zip(new.iter())
                .all(|(a, b)| (a - b).abs() < KMEANS_TOLERANCE)
        });

        centroids = next;
        if converged {
            break;
        }
    }

    (assignments, centroids)
}

/// Deterministic low-dimensional embedding derived from character codes.
/// Used when every real provider fails.
pub fn pseudo_embedding(text: &str) -> Vec<f32> {
    let mut vec = vec![0.0f32; PSEUDO_DIMS];
    for (i, c) in text.chars().enumerate() {
        vec[i % PSEUDO_DIMS] += (c as u32 % 1000) as f32 / 1000.0;
    }
    vec
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Value of a metadata key in `extra`, when it is a string longer than 3
/// characters.
fn meta_field(result: &SearchResult, key: &str) -> Option<String> {
    result
        .metadata
        .extra
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| s.len() > 3)
        .map(str::to_string)
}

fn build_approach(
    query: &str,
    results: &[SearchResult],
    members: &[usize],
    vectors: &[Vec<f32>],
    centroid: &[f32],
    today: NaiveDate,
) -> Approach {
    let first = &results[members[0]];

    let topic = members
        .iter()
        .find_map(|&i| meta_field(&results[i], "topic"))
        .or_else(|| {
            if first.doc_title.is_empty() {
                None
            } else {
                Some(first.doc_title.clone())
            }
        })
        .unwrap_or_else(|| query.to_string());

    let method = members
        .iter()
        .find_map(|&i| {
            meta_field(&results[i], "approach").or_else(|| meta_field(&results[i], "method"))
        })
        .or_else(|| {
            if first.doc_title.is_empty() {
                None
            } else {
                Some(first.doc_title.clone())
            }
        })
        .unwrap_or_else(|| topic.clone());

    let summary = {
        let joined = members
            .iter()
            .take(2)
            .map(|&i| collapse_whitespace(&results[i].text))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            truncate_chars(&collapse_whitespace(&first.text), SUMMARY_MAX_CHARS)
        } else {
            truncate_chars(&joined, SUMMARY_MAX_CHARS)
        }
    };

    let sources = members
        .iter()
        .map(|&i| {
            let r = &results[i];
            ApproachSource {
                title: r.doc_title.clone(),
                url: r.source_url.clone(),
                snippet: truncate_chars(&collapse_whitespace(&r.text), SNIPPET_MAX_CHARS),
            }
        })
        .collect();

    let consensus = consensus_score(results, members, vectors, centroid, today);

    Approach {
        topic,
        method,
        summary,
        sources,
        consensus,
    }
}

/// Consensus: `0.4*quality + 0.4*similarity + 0.2*freshness`, clamped to
/// `[0, 1]`.
fn consensus_score(
    results: &[SearchResult],
    members: &[usize],
    vectors: &[Vec<f32>],
    centroid: &[f32],
    today: NaiveDate,
) -> f64 {
    let n = members.len() as f64;

    let quality: f64 = members
        .iter()
        .map(|&i| {
            results[i]
                .metadata
                .source_quality
                .map(|q| q.trust_weight())
                .unwrap_or(0.5)
        })
        .sum::<f64>()
        / n;

    let similarity: f64 = if centroid.is_empty() {
        0.7
    } else {
        members
            .iter()
            .map(|&i| (cosine_similarity(&vectors[i], centroid) as f64).clamp(0.0, 1.0))
            .sum::<f64>()
            / n
    };

    let freshness: f64 = members
        .iter()
        .map(|&i| {
            let meta = &results[i].metadata;
            let date = meta
                .last_verified
                .as_deref()
                .or(meta.published_date.as_deref())
                .and_then(parse_iso_date);
            match date {
                None => 0.7,
                Some(d) => {
                    let months = months_between(today, d);
                    if months <= 6.0 {
                        1.0
                    } else if months <= 12.0 {
                        0.85
                    } else if months <= 24.0 {
                        0.7
                    } else {
                        0.5
                    }
                }
            }
        })
        .sum::<f64>()
        / n;

    (0.4 * quality + 0.4 * similarity + 0.2 * freshness).clamp(0.0, 1.0)
}

/// Jaccard overlap of lowercased alphanumeric token sets.
pub fn lexical_overlap(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    };
    let set_a = tokens(a);
    let set_b = tokens(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

/// Pick approach pairs worth sending to the LLM: summary overlap inside
/// the configured band, ranked by `overlap + |Δconsensus|`, capped.
pub fn select_pairs(
    approaches: &[Approach],
    min_overlap: f64,
    max_overlap: f64,
    max_pairs: usize,
) -> Vec<(usize, usize)> {
    let mut scored: Vec<(f64, usize, usize)> = Vec::new();
    for i in 0..approaches.len() {
        for j in (i + 1)..approaches.len() {
            let overlap = lexical_overlap(&approaches[i].summary, &approaches[j].summary);
            if overlap < min_overlap || overlap > max_overlap {
                continue;
            }
            let score = overlap + (approaches[i].consensus - approaches[j].consensus).abs();
            scored.push((score, i, j));
        }
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(max_pairs)
        .map(|(_, i, j)| (i, j))
        .collect()
}

fn primary_source(approach: &Approach) -> (&str, Option<&str>) {
    approach
        .sources
        .first()
        .map(|s| (s.title.as_str(), s.url.as_deref()))
        .unwrap_or(("unknown", None))
}

fn contradiction_prompt(a: &Approach, b: &Approach) -> String {
    let (title_a, _) = primary_source(a);
    let (title_b, _) = primary_source(b);
    format!(
        "Compare these two documented approaches and decide whether they \
         contradict each other on substance (not style).\n\n\
         Source A: {title_a}\nTopic: {topic_a}\nMethod: {method_a}\nSummary: {summary_a}\n\n\
         Source B: {title_b}\nTopic: {topic_b}\nMethod: {method_b}\nSummary: {summary_b}\n\n\
         Respond with ONLY a JSON object, no prose:\n\
         {{\"contradiction\": true|false, \"severity\": \"high\"|\"medium\"|\"low\", \
         \"confidence\": 0.0-1.0, \"description\": \"one sentence\"}}",
        title_a = title_a,
        topic_a = a.topic,
        method_a = a.method,
        summary_a = a.summary,
        title_b = title_b,
        topic_b = b.topic,
        method_b = b.method,
        summary_b = b.summary,
    )
}

/// Build a conflict from the model's JSON, filling gaps with defaults:
/// severity normalizes to high/medium/low (default medium), confidence
/// clamps to [0, 1] (default 0.6).
fn conflict_from_json(value: &serde_json::Value, a: &Approach, b: &Approach) -> Conflict {
    let severity = match value
        .get("severity")
        .and_then(|s| s.as_str())
        .unwrap_or("medium")
        .to_lowercase()
        .as_str()
    {
        "high" => "high",
        "low" => "low",
        _ => "medium",
    };

    let confidence = value
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.6)
        .clamp(0.0, 1.0);

    let description = value
        .get("description")
        .and_then(|d| d.as_str())
        .filter(|d| !d.trim().is_empty())
        .unwrap_or("Sources disagree on the recommended approach.")
        .to_string();

    Conflict {
        topic: a.topic.clone(),
        severity: severity.to_string(),
        confidence,
        description,
        source_a: primary_source(a).0.to_string(),
        source_b: primary_source(b).0.to_string(),
    }
}

/// Conflict penalty for an approach: 0.3/0.15/0.05 by the worst severity
/// among conflicts naming any of its sources, else 0.
fn conflict_penalty(approach: &Approach, conflicts: &[Conflict]) -> f64 {
    let names: HashSet<&str> = approach
        .sources
        .iter()
        .flat_map(|s| {
            std::iter::once(s.title.as_str()).chain(s.url.as_deref().into_iter())
        })
        .collect();

    let mut penalty: f64 = 0.0;
    for conflict in conflicts {
        if names.contains(conflict.source_a.as_str()) || names.contains(conflict.source_b.as_str())
        {
            let p = match conflict.severity.as_str() {
                "high" => 0.3,
                "medium" => 0.15,
                _ => 0.05,
            };
            penalty = penalty.max(p);
        }
    }
    penalty
}

/// Index of the approach maximizing `consensus - penalty`.
pub fn recommend(approaches: &[Approach], conflicts: &[Conflict]) -> Option<usize> {
    approaches
        .iter()
        .enumerate()
        .map(|(i, a)| (i, a.consensus - conflict_penalty(a, conflicts)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Citation, Metadata};

    fn result(chunk_id: i64, title: &str, text: &str) -> SearchResult {
        SearchResult {
            chunk_id,
            text: text.to_string(),
            similarity: 0.8,
            document_id: format!("doc-{}", chunk_id),
            doc_title: title.to_string(),
            source_url: None,
            metadata: Metadata::default(),
            citation: Citation {
                title: title.to_string(),
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
    fn cluster_count_formula() {
        assert_eq!(cluster_count(1), 1);
        assert_eq!(cluster_count(2), 1);
        assert_eq!(cluster_count(3), 1);
        assert_eq!(cluster_count(5), 1);
        assert_eq!(cluster_count(6), 2);
        assert_eq!(cluster_count(9), 3);
        assert_eq!(cluster_count(100), 3);
    }

    #[test]
    fn kmeans_groups_clearly_separated_vectors() {
        // Three groups of three near-identical unit vectors. Seeding is
        // first-k, so the leading vectors span the groups.
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![0.99, 0.01, 0.0],
            vec![0.01, 0.99, 0.0],
            vec![0.0, 0.01, 0.99],
            vec![0.98, 0.02, 0.0],
            vec![0.0, 0.98, 0.02],
            vec![0.02, 0.0, 0.98],
        ];
        let (assignments, centroids) = kmeans(&vectors, 3);

        assert_eq!(centroids.len(), 3);
        // x-aligned group
        assert_eq!(assignments[0], assignments[3]);
        assert_eq!(assignments[3], assignments[6]);
        // y-aligned group
        assert_eq!(assignments[1], assignments[4]);
        assert_eq!(assignments[4], assignments[7]);
        // z-aligned group
        assert_eq!(assignments[2], assignments[5]);
        assert_eq!(assignments[5], assignments[8]);
        // The three groups are distinct clusters.
        let distinct: HashSet<usize> =
            vec![assignments[0], assignments[1], assignments[2]].into_iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn kmeans_assignments_stable_under_extra_iteration() {
        let vectors: Vec<Vec<f32>> = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.9, 0.1, 0.0],
            vec![0.1, 0.9, 0.0],
            vec![0.95, 0.05, 0.0],
            vec![0.05, 0.95, 0.0],
            vec![0.92, 0.08, 0.0],
        ];
        let (a1, c1) = kmeans(&vectors, 2);
        // Re-running from the converged centroids must not move them.
        let mut again = c1.clone();
        for (i, vec) in vectors.iter().enumerate() {
            let mut best = 0;
            let mut best_sim = f32::NEG_INFINITY;
            for (c, centroid) in again.iter().enumerate() {
                let sim = cosine_similarity(vec, centroid);
                if sim > best_sim {
                    best_sim = sim;
                    best = c;
                }
            }
            assert_eq!(best, a1[i], "assignment {} unstable", i);
        }
        let mut counts = vec![0usize; c1.len()];
        let mut sums = vec![vec![0.0f32; 3]; c1.len()];
        for (i, vec) in vectors.iter().enumerate() {
            counts[a1[i]] += 1;
            for d in 0..3 {
                sums[a1[i]][d] += vec[d];
            }
        }
        for c in 0..c1.len() {
            if counts[c] == 0 {
                continue;
            }
            for d in 0..3 {
                again[c][d] = sums[c][d] / counts[c] as f32;
                assert!((again[c][d] - c1[c][d]).abs() < KMEANS_TOLERANCE);
            }
        }
    }

    #[test]
    fn pseudo_embedding_deterministic_and_fixed_dim() {
        let a = pseudo_embedding("some text content");
        let b = pseudo_embedding("some text content");
        let c = pseudo_embedding("different content");
        assert_eq!(a.len(), PSEUDO_DIMS);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn lexical_overlap_jaccard() {
        assert_eq!(lexical_overlap("a b c", "a b c"), 1.0);
        assert_eq!(lexical_overlap("a b", "c d"), 0.0);
        // {a,b,c} ∩ {b,c,d} = 2, ∪ = 4
        assert!((lexical_overlap("a b c", "b c d") - 0.5).abs() < 1e-9);
        // Case and punctuation insensitive
        assert_eq!(lexical_overlap("Hello, World!", "hello world"), 1.0);
        assert_eq!(lexical_overlap("", ""), 0.0);
    }

    fn approach(topic: &str, summary: &str, consensus: f64, source: &str) -> Approach {
        Approach {
            topic: topic.to_string(),
            method: topic.to_string(),
            summary: summary.to_string(),
            sources: vec![ApproachSource {
                title: source.to_string(),
                url: None,
                snippet: summary.to_string(),
            }],
            consensus,
        }
    }

    #[test]
    fn pair_selection_respects_overlap_band() {
        let approaches = vec![
            approach("a", "configure the database pool size limit", 0.8, "s1"),
            approach("b", "configure the database pool timeout limit", 0.5, "s2"),
            approach("c", "unrelated words entirely different things", 0.6, "s3"),
        ];
        let pairs = select_pairs(&approaches, 0.2, 0.7, 6);
        assert_eq!(pairs, vec![(0, 1)]);

        // Identical summaries exceed max_overlap and are skipped.
        let twins = vec![
            approach("a", "identical summary words", 0.8, "s1"),
            approach("b", "identical summary words", 0.5, "s2"),
        ];
        assert!(select_pairs(&twins, 0.2, 0.7, 6).is_empty());
    }

    #[test]
    fn severity_normalization_and_confidence_clamp() {
        let a = approach("t", "s", 0.8, "src-a");
        let b = approach("t", "s", 0.5, "src-b");

        let value = serde_json::json!({"contradiction": true, "severity": "CRITICAL", "confidence": 3.5});
        let conflict = conflict_from_json(&value, &a, &b);
        assert_eq!(conflict.severity, "medium");
        assert_eq!(conflict.confidence, 1.0);

        let value = serde_json::json!({"contradiction": true});
        let conflict = conflict_from_json(&value, &a, &b);
        assert_eq!(conflict.severity, "medium");
        assert_eq!(conflict.confidence, 0.6);
        assert!(!conflict.description.is_empty());
    }

    #[test]
    fn recommendation_penalizes_conflicted_approaches() {
        let approaches = vec![
            approach("first", "summary one", 0.9, "conflicted-source"),
            approach("second", "summary two", 0.7, "clean-source"),
        ];
        let conflicts = vec![Conflict {
            topic: "first".to_string(),
            severity: "high".to_string(),
            confidence: 0.9,
            description: "disagree".to_string(),
            source_a: "conflicted-source".to_string(),
            source_b: "elsewhere".to_string(),
        }];

        // 0.9 - 0.3 = 0.6 < 0.7: the clean approach wins.
        assert_eq!(recommend(&approaches, &conflicts), Some(1));
        // Without conflicts the higher consensus wins.
        assert_eq!(recommend(&approaches, &[]), Some(0));
    }

    #[test]
    fn approach_fields_fall_back_in_order() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let mut r1 = result(1, "Guide Title", "First snippet text here.");
        r1.metadata
            .extra
            .insert("topic".to_string(), serde_json::Value::from("Connection pooling"));
        let r2 = result(2, "Other Doc", "Second snippet text here.");

        let results = vec![r1, r2];
        let vectors = vec![vec![1.0, 0.0], vec![0.9, 0.1]];
        let centroid = vec![0.95, 0.05];

        let a = build_approach("the query", &results, &[0, 1], &vectors, &centroid, today);
        assert_eq!(a.topic, "Connection pooling");
        assert_eq!(a.method, "Guide Title"); // no approach/method key
        assert!(a.summary.contains("First snippet"));
        assert!(a.summary.contains("Second snippet"));
        assert_eq!(a.sources.len(), 2);
        assert!(a.consensus > 0.0 && a.consensus <= 1.0);
    }

    #[test]
    fn summary_truncated_to_limit() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let long_text = "word ".repeat(200);
        let results = vec![result(1, "Doc", &long_text)];
        let vectors = vec![vec![1.0]];
        let a = build_approach("q", &results, &[0], &vectors, &[1.0], today);
        assert!(a.summary.chars().count() <= SUMMARY_MAX_CHARS);
        assert!(a.sources[0].snippet.chars().count() <= SNIPPET_MAX_CHARS);
    }
}
