//! Core data models used throughout the retrieval backend.
//!
//! These types represent the collections, documents, chunks, search results,
//! and cost rows that flow through the ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing state of a document. Mutated only by the ingestion
/// orchestrator; `Error` is terminal until an explicit restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Complete,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Chunking => "chunking",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Complete => "complete",
            DocumentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "extracting" => Some(DocumentStatus::Extracting),
            "chunking" => Some(DocumentStatus::Chunking),
            "embedding" => Some(DocumentStatus::Embedding),
            "complete" => Some(DocumentStatus::Complete),
            "error" => Some(DocumentStatus::Error),
            _ => None,
        }
    }
}

/// Source trust tier carried in document metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceQuality {
    Official,
    Verified,
    Community,
}

impl SourceQuality {
    /// Multiplicative trust weight used by the rescorer and the
    /// synthesis consensus score.
    pub fn trust_weight(&self) -> f64 {
        match self {
            SourceQuality::Official => 1.0,
            SourceQuality::Verified => 0.85,
            SourceQuality::Community => 0.6,
        }
    }
}

/// Free-form metadata attached to a document or chunk.
///
/// Recognized keys are explicit fields; anything else is preserved verbatim
/// in `extra` and round-trips through storage untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_quality: Option<SourceQuality>,
    /// ISO date of last human verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<String>,
    /// ISO publication date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// 1-based page number, when a `[Page N]` marker covers the chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Unrecognized keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Metadata {
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A named group of documents. Deletion cascades to documents, chunks,
/// and stored files.
#[derive(Debug, Clone, Serialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A single ingested document inside a collection.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub collection_id: String,
    pub title: String,
    pub content_type: String,
    pub file_size: i64,
    pub source_url: Option<String>,
    pub file_path: Option<String>,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub metadata: Metadata,
    pub created_at: i64,
    pub processed_at: Option<i64>,
    pub updated_at: i64,
}

/// A chunk of a document's text, carrying one embedding.
///
/// `(document_id, chunk_index)` is unique; `id` is the surrogate row id
/// assigned on insert (0 before).
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: i64,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: i64,
    pub embedding: Vec<f32>,
    pub embedding_model: String,
    pub metadata: Metadata,
}

/// Citation fields attached to every search result.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// Which search leg produced a fused result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionSource {
    Vector,
    Bm25,
    Both,
}

/// A ranked search result.
///
/// The base fields come from the vector or BM25 leg; the optional groups
/// are filled in as the result flows through fusion, trust rescoring, and
/// reranking. Absent fields are omitted from JSON.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: i64,
    pub text: String,
    pub similarity: f64,
    pub document_id: String,
    pub doc_title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub metadata: Metadata,
    pub citation: Citation,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bm25_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fused_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<FusionSource>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recency_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_similarity: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_similarity: Option<f64>,
}

impl SearchResult {
    /// The score downstream stages rank by: rerank score when present,
    /// then fused score, then raw similarity.
    pub fn effective_score(&self) -> f64 {
        self.rerank_score
            .or(self.fused_score)
            .unwrap_or(self.similarity)
    }
}

/// Operation category for a cost row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostOperation {
    Embed,
    Rerank,
    Generate,
}

impl CostOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostOperation::Embed => "embed",
            CostOperation::Rerank => "rerank",
            CostOperation::Generate => "generate",
        }
    }
}

/// One append-only usage row in the cost ledger.
#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
    pub provider: String,
    pub operation: CostOperation,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub model: String,
    pub collection_id: Option<String>,
    pub created_at: i64,
}

/// Budget alert tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Warning,
    LimitReached,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Warning => "warning",
            AlertType::LimitReached => "limit_reached",
        }
    }
}

/// A budget alert row. At most one per `(alert_type, period)` in any
/// 24-hour window.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub alert_type: AlertType,
    pub period: String,
    pub threshold_usd: f64,
    pub current_spend_usd: f64,
    pub triggered_at: i64,
}

/// Current unix timestamp in seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Format a unix timestamp as ISO 8601 for wire responses.
pub fn ts_iso(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
