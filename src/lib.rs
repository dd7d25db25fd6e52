//! # docsynth
//!
//! **A multi-collection hybrid-retrieval RAG backend.**
//!
//! docsynth ingests heterogeneous documents (PDF, DOCX, Markdown, HTML,
//! crawled web pages), turns them into vector-plus-lexical indexes, and
//! answers natural-language queries by fusing dense-vector and BM25
//! search, trust/recency rescoring, and optional cross-encoder reranking.
//! On top of retrieval it synthesizes grouped "approaches" with
//! contradiction detection, and every cloud call is metered against a
//! monthly budget that degrades the system to local models when
//! exhausted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────┐   ┌───────────┐
//! │ Upload/Crawl │──▶│ Extract → Chunk → Embed   │──▶│  SQLite   │
//! └──────────────┘   └───────────────────────────┘   │ FTS5+Vec  │
//!                                                    └─────┬─────┘
//!                  ┌─────────────────────────────────────┤
//!                  ▼                                      ▼
//!        ┌──────────────────┐                ┌─────────────────────┐
//!        │ Hybrid Search    │                │ Synthesis           │
//!        │ RRF → Trust →    │───────────────▶│ k-means → approaches│
//!        │ Rerank           │                │ → contradictions    │
//!        └──────────────────┘                └─────────────────────┘
//! ```
//!
//! ## Query flow
//!
//! 1. The **hybrid fuser** ([`search`]) runs the vector and BM25 legs in
//!    parallel and merges them with weighted Reciprocal Rank Fusion.
//! 2. The **trust/recency rescorer** ([`rescore`]) optionally reweights
//!    results by source quality and verification age.
//! 3. The **cross-encoder reranker** ([`rerank`]) re-orders the shortlist
//!    via a cloud provider, degrading to a local model and then to
//!    pass-through.
//! 4. The **synthesis engine** ([`synthesis`]) clusters top results and
//!    builds consensus-scored approaches with LLM contradiction checks.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration + environment overlay |
//! | [`error`] | Typed error kinds with stable surface codes |
//! | [`models`] | Core data types: `Collection`, `Document`, `Chunk`, `SearchResult` |
//! | [`db`] | SQLite connection pool (WAL) |
//! | [`migrate`] | Idempotent schema migrations |
//! | [`store`] | Storage gateway: typed queries, transactional chunk replacement |
//! | [`files`] | Stored-file layout under the storage root |
//! | [`extract`] | MIME-dispatched extraction (PDF, DOCX, HTML, Markdown) |
//! | [`chunker`] | Paragraph-boundary chunker with overlap |
//! | [`embedding`] | Provider registry, router, retries, vector utilities |
//! | [`costs`] | Pricing table, cost ledger, budget guard, fallback mode |
//! | [`ingest`] | Per-document ingestion state machine |
//! | [`crawler`] | SSRF-guarded fetcher and bounded same-origin crawler |
//! | [`search`] | Vector, BM25, and hybrid RRF search |
//! | [`rescore`] | Trust/recency rescoring |
//! | [`rerank`] | Cross-encoder reranking with provider fallback |
//! | [`llm`] | LLM completion capability + defensive JSON parsing |
//! | [`synthesis`] | k-means clustering, approaches, contradiction detection |
//! | [`server`] | Axum HTTP surface |

pub mod chunker;
pub mod config;
pub mod costs;
pub mod crawler;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod files;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod rerank;
pub mod rescore;
pub mod search;
pub mod server;
pub mod store;
pub mod synthesis;
