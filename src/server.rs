//! HTTP server: the JSON API surface of the backend.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/collections` | Create a collection |
//! | `GET` | `/api/collections` | List collections with document counts |
//! | `GET` | `/api/collections/{id}` | One collection with chunk totals |
//! | `DELETE` | `/api/collections/{id}` | Delete a collection and its documents |
//! | `POST` | `/api/ingest` | Multipart upload: `collection_id` + `files[]` |
//! | `GET` | `/api/ingest/status/{doc_id}` | Ingestion status and progress |
//! | `GET` | `/api/documents` | List documents (filters: status, limit, offset) |
//! | `GET` | `/api/documents/{id}` | One document |
//! | `DELETE` | `/api/documents/{id}` | Delete a document, its chunks, and file |
//! | `POST` | `/api/search` | Vector or hybrid search |
//! | `POST` | `/api/crawl` | Fetch or crawl a site into a collection |
//! | `POST` | `/api/synthesis/compare` | Approaches + contradictions (404 when disabled) |
//! | `GET` | `/api/costs/summary` | Monthly spend, budget, fallback state |
//! | `GET` | `/api/costs/history` | Usage breakdown over a window |
//! | `GET` | `/api/costs/alerts` | Recent budget alerts |
//! | `GET` | `/health` | Liveness + version |
//!
//! # Error contract
//!
//! ```json
//! { "error": "...", "code": "INVALID_INPUT", "timestamp": "..." }
//! ```

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::costs::{month_start_ts, CostTracker};
use crate::crawler::{CrawlMode, CrawlRequest, Crawler};
use crate::db;
use crate::error::Error;
use crate::extract;
use crate::files;
use crate::ingest::IngestOrchestrator;
use crate::llm::HttpLlmClient;
use crate::migrate;
use crate::models::{now_ts, ts_iso, DocumentStatus, Metadata, SearchResult};
use crate::rerank::{RerankOptions, Reranker};
use crate::rescore;
use crate::search::{HybridParams, SearchEngine};
use crate::store::Store;
use crate::synthesis::SynthesisEngine;
use crate::{costs::RuntimeOverrides, embedding::EmbeddingRouter};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Store,
    search: SearchEngine,
    reranker: Reranker,
    synthesis: SynthesisEngine,
    orchestrator: IngestOrchestrator,
    crawler: Crawler,
    costs: CostTracker,
}

/// Wire everything together and serve until terminated.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let pool = db::connect(&config).await?;
    migrate::run_migrations(&pool).await?;

    let state = build_state(config.clone(), Store::new(pool))?;

    let app = build_router(state);
    let bind = config.server.bind.clone();
    info!(bind = %bind, "server listening");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Construct all components over one store.
pub fn build_state(config: Config, store: Store) -> anyhow::Result<AppState> {
    let overrides = RuntimeOverrides::new();
    let costs = CostTracker::new(store.clone(), config.budget.clone(), overrides);
    let router = EmbeddingRouter::new(config.embedding.clone(), costs.clone())?;
    let search = SearchEngine::new(store.clone(), router.clone(), config.search.clone());
    let reranker = Reranker::new(config.rerank.clone(), costs.clone())?;
    let llm = Arc::new(HttpLlmClient::new(config.synthesis.contradiction_model.clone())?);
    let synthesis = SynthesisEngine::new(
        router.clone(),
        llm,
        costs.clone(),
        config.synthesis.clone(),
    );
    let orchestrator = IngestOrchestrator::new(store.clone(), router, &config);
    let crawler = Crawler::new(store.clone(), orchestrator.clone(), config.crawler.clone())?;

    Ok(AppState {
        config: Arc::new(config),
        store,
        search,
        reranker,
        synthesis,
        orchestrator,
        crawler,
        costs,
    })
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = state.config.ingest.max_file_size as usize + 1024 * 1024;

    Router::new()
        .route("/api/collections", post(create_collection).get(list_collections))
        .route(
            "/api/collections/{id}",
            get(get_collection).delete(delete_collection),
        )
        .route("/api/ingest", post(ingest_files))
        .route("/api/ingest/status/{doc_id}", get(ingest_status))
        .route("/api/documents", get(list_documents))
        .route("/api/documents/{id}", get(get_document).delete(delete_document))
        .route("/api/search", post(search))
        .route("/api/crawl", post(crawl))
        .route("/api/synthesis/compare", post(synthesis_compare))
        .route("/api/costs/summary", get(costs_summary))
        .route("/api/costs/history", get(costs_history))
        .route("/api/costs/alerts", get(costs_alerts))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

// ============ Error envelope ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    timestamp: String,
}

struct AppError(Error);

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_)
            | Error::EmptyQuery
            | Error::InvalidTopK(_)
            | Error::TermlessQuery => StatusCode::BAD_REQUEST,
            Error::CollectionNotFound(_) | Error::DocumentNotFound(_) | Error::FeatureDisabled(_) => {
                StatusCode::NOT_FOUND
            }
            Error::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.surface_code().to_string(),
            details: None,
            timestamp: ts_iso(now_ts()),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

// ============ Collections ============

#[derive(Deserialize)]
struct CreateCollectionRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

async fn create_collection(
    State(state): State<AppState>,
    Json(req): Json<CreateCollectionRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.name.trim().is_empty() {
        return Err(Error::Validation("name must not be empty".to_string()).into());
    }
    let collection = state
        .store
        .create_collection(req.name.trim(), req.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(collection)))
}

async fn list_collections(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let collections = state.store.list_collections().await?;
    Ok(Json(serde_json::json!({ "collections": collections })))
}

async fn get_collection(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let collection = state.store.get_collection(&id).await?;
    let total_chunks = state.store.collection_chunk_total(&id).await?;
    Ok(Json(serde_json::json!({
        "collection": collection,
        "total_chunks": total_chunks,
    })))
}

async fn delete_collection(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let paths = state.store.delete_collection(&id).await?;
    for path in paths {
        files::remove_file(std::path::Path::new(&path)).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ Ingest ============

#[derive(Serialize)]
struct IngestedDocument {
    id: String,
    title: String,
    status: DocumentStatus,
}

async fn ingest_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut collection_id: Option<String> = None;
    let mut uploads: Vec<(String, String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("invalid multipart payload: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("collection_id") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::Validation(e.to_string()))?;
                collection_id = Some(value.trim().to_string());
            }
            Some("files") => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload")
                    .to_string();
                let declared = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::Validation(e.to_string()))?;
                // Reject oversized files before any document is created.
                if bytes.len() as u64 > state.config.ingest.max_file_size {
                    return Err(Error::FileTooLarge {
                        size: bytes.len() as u64,
                        limit: state.config.ingest.max_file_size,
                    }
                    .into());
                }
                let mime = resolve_content_type(&filename, declared.as_deref())?;
                uploads.push((filename, mime, bytes.to_vec()));
            }
            _ => continue,
        }
    }

    let collection_id = collection_id
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Validation("collection_id is required".to_string()))?;
    if uploads.is_empty() {
        return Err(Error::Validation("no files provided".to_string()).into());
    }

    let mut documents = Vec::with_capacity(uploads.len());

    for (filename, mime, bytes) in uploads {
        let title = filename
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| filename.clone());

        let doc = state
            .store
            .create_document(
                &collection_id,
                &title,
                &mime,
                bytes.len() as i64,
                None,
                None,
                &Metadata::default(),
            )
            .await?;

        let ext = files::extension_of(&filename);
        let path = files::store_file(
            state.orchestrator.storage_root(),
            &collection_id,
            &doc.id,
            &ext,
            &bytes,
        )
        .await?;
        state
            .store
            .set_document_file(&doc.id, &path.to_string_lossy(), bytes.len() as i64)
            .await?;

        state
            .orchestrator
            .ingest_detached(doc.id.clone(), CancellationToken::new());

        documents.push(IngestedDocument {
            id: doc.id,
            title: doc.title,
            status: DocumentStatus::Pending,
        });
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "documents": documents })),
    ))
}

/// Resolve a supported MIME type from the filename extension, falling
/// back to the declared multipart content type.
fn resolve_content_type(filename: &str, declared: Option<&str>) -> Result<String, Error> {
    let by_ext = filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
    let mime = match by_ext.as_deref() {
        Some("pdf") => extract::MIME_PDF,
        Some("docx") => extract::MIME_DOCX,
        Some("md") | Some("markdown") => extract::MIME_MARKDOWN,
        Some("html") | Some("htm") => extract::MIME_HTML,
        Some("txt") => extract::MIME_PLAIN,
        _ => match declared {
            Some(ct)
                if matches!(
                    ct.split(';').next().unwrap_or(ct).trim(),
                    extract::MIME_PDF
                        | extract::MIME_DOCX
                        | extract::MIME_MARKDOWN
                        | extract::MIME_HTML
                        | extract::MIME_PLAIN
                ) =>
            {
                return Ok(ct.split(';').next().unwrap_or(ct).trim().to_string())
            }
            other => {
                return Err(Error::UnsupportedType(
                    other.unwrap_or("unknown").to_string(),
                ))
            }
        },
    };
    Ok(mime.to_string())
}

#[derive(Serialize)]
struct IngestStatusResponse {
    document_id: String,
    status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    progress_percent: u8,
    chunk_count: i64,
}

async fn ingest_status(
    State(state): State<AppState>,
    AxumPath(doc_id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let doc = state.store.get_document(&doc_id).await?;
    let chunk_count = state.store.chunk_count(&doc_id).await?;

    let progress_percent = match doc.status {
        DocumentStatus::Pending => 0,
        DocumentStatus::Extracting => 25,
        DocumentStatus::Chunking => 50,
        DocumentStatus::Embedding => 75,
        DocumentStatus::Complete => 100,
        DocumentStatus::Error => 0,
    };

    Ok(Json(IngestStatusResponse {
        document_id: doc.id,
        status: doc.status,
        error_message: doc.error_message,
        progress_percent,
        chunk_count,
    }))
}

// ============ Documents ============

#[derive(Deserialize)]
struct ListDocumentsQuery {
    collection_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn list_documents(
    State(state): State<AppState>,
    Query(query): Query<ListDocumentsQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(
            DocumentStatus::parse(s)
                .ok_or_else(|| Error::Validation(format!("unknown status: {}", s)))?,
        ),
    };

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    state.store.get_collection(&query.collection_id).await?;

    let documents = state
        .store
        .list_documents(&query.collection_id, status, limit, offset)
        .await?;
    Ok(Json(serde_json::json!({
        "documents": documents,
        "limit": limit,
        "offset": offset,
    })))
}

async fn get_document(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let doc = state.store.get_document(&id).await?;
    Ok(Json(doc))
}

async fn delete_document(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let file_path = state.store.delete_document(&id).await?;
    if let Some(path) = file_path {
        files::remove_file(std::path::Path::new(&path)).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ Search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    collection_id: String,
    #[serde(default)]
    top_k: Option<i64>,
    #[serde(default)]
    min_similarity: Option<f64>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    weights: Option<SearchWeights>,
    #[serde(default)]
    rrf_k: Option<f64>,
    #[serde(default)]
    rerank_provider: Option<String>,
}

#[derive(Deserialize)]
struct SearchWeights {
    vector: f64,
    bm25: f64,
}

#[derive(Serialize)]
struct SearchMetadata {
    search_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    vector_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bm25_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fused_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding_provider: Option<String>,
    trust_scoring_applied: bool,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchResult>,
    total_results: usize,
    search_time_ms: u128,
    metadata: SearchMetadata,
}

async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<impl IntoResponse> {
    let started = Instant::now();
    let mode = req
        .mode
        .clone()
        .unwrap_or_else(|| state.config.search.mode.clone());

    let (mut results, metadata) = match mode.as_str() {
        "vector" => {
            let top_k = req.top_k.unwrap_or(crate::search::DEFAULT_VECTOR_TOP_K as i64);
            let (results, provider) = state
                .search
                .vector_search(
                    &req.query,
                    &req.collection_id,
                    top_k,
                    req.min_similarity,
                    None,
                )
                .await?;
            let count = results.len();
            (
                results,
                SearchMetadata {
                    search_mode: "vector".to_string(),
                    vector_count: Some(count),
                    bm25_count: None,
                    fused_count: None,
                    embedding_provider: Some(provider),
                    trust_scoring_applied: false,
                },
            )
        }
        "hybrid" => {
            let params = HybridParams {
                top_k: req.top_k.map(|k| k.max(0) as usize),
                min_similarity: req.min_similarity,
                weights: req.weights.as_ref().map(|w| (w.vector, w.bm25)),
                rrf_k: req.rrf_k,
                provider_override: None,
            };
            let outcome = state
                .search
                .hybrid_search(&req.query, &req.collection_id, &params)
                .await?;
            (
                outcome.results,
                SearchMetadata {
                    search_mode: "hybrid".to_string(),
                    vector_count: Some(outcome.vector_count),
                    bm25_count: Some(outcome.bm25_count),
                    fused_count: Some(outcome.fused_count),
                    embedding_provider: Some(outcome.embedding_provider),
                    trust_scoring_applied: false,
                },
            )
        }
        other => {
            return Err(Error::Validation(format!(
                "unknown search mode: {}. Use vector or hybrid.",
                other
            ))
            .into())
        }
    };

    let mut metadata = metadata;
    if state.config.search.trust_scoring {
        rescore::rescore(&mut results);
        metadata.trust_scoring_applied = true;
    }

    let results = state
        .reranker
        .rerank(
            &req.query,
            results,
            &RerankOptions {
                provider: req.rerank_provider.clone(),
                top_k: req.top_k.map(|k| k.max(0) as usize),
                max_candidates: None,
            },
        )
        .await?;

    Ok(Json(SearchResponse {
        query: req.query,
        total_results: results.len(),
        results,
        search_time_ms: started.elapsed().as_millis(),
        metadata,
    }))
}

// ============ Crawl ============

#[derive(Deserialize)]
struct CrawlRequestBody {
    url: String,
    collection_id: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    max_pages: Option<usize>,
    #[serde(default)]
    title_prefix: Option<String>,
}

async fn crawl(
    State(state): State<AppState>,
    Json(req): Json<CrawlRequestBody>,
) -> ApiResult<impl IntoResponse> {
    let mode = match req.mode.as_deref() {
        None | Some("single") => CrawlMode::Single,
        Some("crawl") => CrawlMode::Crawl,
        Some(other) => {
            return Err(
                Error::Validation(format!("unknown crawl mode: {}", other)).into()
            )
        }
    };

    let request = CrawlRequest {
        url: req.url,
        collection_id: req.collection_id,
        mode,
        max_pages: req
            .max_pages
            .unwrap_or(state.config.crawler.max_pages),
        title_prefix: req.title_prefix,
    };

    let cancel = CancellationToken::new();
    let pages = state.crawler.crawl(&request, &cancel).await?;
    Ok(Json(serde_json::json!({
        "pages": pages,
        "total_pages": pages.len(),
    })))
}

// ============ Synthesis ============

#[derive(Deserialize)]
struct SynthesisRequest {
    query: String,
    collection_id: String,
    #[serde(default)]
    top_k: Option<i64>,
}

async fn synthesis_compare(
    State(state): State<AppState>,
    Json(req): Json<SynthesisRequest>,
) -> ApiResult<impl IntoResponse> {
    // Feature-gated: absent unless enabled.
    if !state.config.synthesis.enabled {
        return Err(Error::FeatureDisabled("synthesis").into());
    }

    let started = Instant::now();
    let top_k = req.top_k.unwrap_or(50);

    let outcome = state
        .search
        .hybrid_search(
            &req.query,
            &req.collection_id,
            &HybridParams {
                top_k: Some(top_k.max(1) as usize),
                ..Default::default()
            },
        )
        .await?;

    let cancel = CancellationToken::new();
    let synthesis = state
        .synthesis
        .synthesize(&req.query, outcome.results, &cancel)
        .await?;

    Ok(Json(serde_json::json!({
        "query": req.query,
        "approaches": synthesis.approaches,
        "conflicts": synthesis.conflicts,
        "recommended": synthesis.recommended,
        "metadata": {
            "total_sources": synthesis.total_sources,
            "approaches_found": synthesis.approaches.len(),
            "conflicts_found": synthesis.conflicts.len(),
            "used_fallback_embeddings": synthesis.used_fallback_embeddings,
            "synthesis_time_ms": started.elapsed().as_millis(),
        },
    })))
}

// ============ Costs ============

async fn costs_summary(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let monthly = state.costs.monthly_spend().await?;
    let budget = state.config.budget.monthly_usd;
    Ok(Json(serde_json::json!({
        "monthly_spend_usd": monthly,
        "monthly_budget_usd": budget,
        "budget_used_fraction": if budget > 0.0 { monthly / budget } else { 0.0 },
        "fallback_active": state.costs.overrides().fallback_active(),
    })))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

async fn costs_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let start_ts = match query.start.as_deref() {
        Some(s) => date_to_ts(s)?,
        None => month_start_ts(),
    };
    let end_ts = match query.end.as_deref() {
        Some(s) => date_to_ts(s)? + 86_400,
        None => now_ts() + 1,
    };

    let breakdown = state.costs.breakdown(start_ts, end_ts).await?;
    Ok(Json(serde_json::json!({
        "start": ts_iso(start_ts),
        "end": ts_iso(end_ts),
        "breakdown": breakdown,
    })))
}

fn date_to_ts(s: &str) -> Result<i64, Error> {
    let date = rescore::parse_iso_date(s)
        .ok_or_else(|| Error::Validation(format!("invalid date: {}", s)))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .expect("valid midnight")
        .and_utc()
        .timestamp())
}

async fn costs_alerts(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let alerts = state.store.list_alerts(50).await?;
    Ok(Json(serde_json::json!({ "alerts": alerts })))
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_resolution() {
        assert_eq!(
            resolve_content_type("doc.pdf", None).unwrap(),
            extract::MIME_PDF
        );
        assert_eq!(
            resolve_content_type("Notes.MD", None).unwrap(),
            extract::MIME_MARKDOWN
        );
        assert_eq!(
            resolve_content_type("page.htm", None).unwrap(),
            extract::MIME_HTML
        );
        assert_eq!(
            resolve_content_type("report.docx", None).unwrap(),
            extract::MIME_DOCX
        );
        // Unknown extension falls back to a declared supported type.
        assert_eq!(
            resolve_content_type("upload", Some("text/plain; charset=utf-8")).unwrap(),
            "text/plain"
        );
        assert!(matches!(
            resolve_content_type("archive.zip", None),
            Err(Error::UnsupportedType(_))
        ));
        assert!(matches!(
            resolve_content_type("upload", Some("application/zip")),
            Err(Error::UnsupportedType(_))
        ));
    }
}
