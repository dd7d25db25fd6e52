//! Typed errors for the retrieval backend.
//!
//! Every failure that can cross a module boundary is one of these kinds.
//! Each kind carries a stable surface code (the `code` field of the HTTP
//! error envelope) so handlers never have to string-match messages.
//!
//! Propagation policy: recoverable provider failures are handled locally
//! with fallbacks (embed → local, rerank → local → pass-through,
//! contradiction LLM → skip pair) and never reach callers as errors;
//! everything else propagates to the nearest operation boundary.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Inputs violate documented constraints. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Search query is empty after trimming.
    #[error("query must not be empty")]
    EmptyQuery,

    /// `top_k` must be positive.
    #[error("top_k must be positive, got {0}")]
    InvalidTopK(i64),

    /// Full-text query had no valid tokens after operator stripping.
    #[error("query contains no searchable terms")]
    TermlessQuery,

    /// Requested collection does not exist.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// Requested document does not exist.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// Endpoint exists but its feature flag is off; surfaced as 404.
    #[error("{0} is not enabled")]
    FeatureDisabled(&'static str),

    /// Upload exceeds the configured size cap.
    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    /// MIME type has no registered extractor.
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),

    /// Database connectivity or query failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A uniqueness or foreign-key constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Text extraction failed; `stage` names the extractor that failed.
    #[error("extraction failed at {stage}: {message}")]
    Extraction { stage: &'static str, message: String },

    /// Chunking produced no usable output.
    #[error("chunking failed: {0}")]
    Chunking(String),

    /// All embedding providers failed, including the local fallback.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// Reranking failed past every fallback.
    #[error("rerank failed: {0}")]
    Rerank(String),

    /// LLM completion failed.
    #[error("llm call failed: {0}")]
    Llm(String),

    /// Operation aborted by its cancellation signal.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Stable machine-readable code for the HTTP error envelope.
    pub fn surface_code(&self) -> &'static str {
        match self {
            Error::Validation(_)
            | Error::EmptyQuery
            | Error::InvalidTopK(_)
            | Error::TermlessQuery => "INVALID_INPUT",
            Error::CollectionNotFound(_) => "COLLECTION_NOT_FOUND",
            Error::DocumentNotFound(_) => "DOCUMENT_NOT_FOUND",
            Error::FeatureDisabled(_) => "NOT_FOUND",
            Error::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Error::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            Error::Storage(_) | Error::Conflict(_) => "DATABASE_ERROR",
            Error::Extraction { .. } | Error::Chunking(_) | Error::Cancelled => "PROCESSING_ERROR",
            Error::Embedding(_) => "EMBEDDING_ERROR",
            Error::Rerank(_) | Error::Llm(_) => "PROCESSING_ERROR",
        }
    }

    /// True for failures worth retrying with backoff (callers with an
    /// explicit retry policy only).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(sqlx::Error::PoolTimedOut))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_codes_are_stable() {
        assert_eq!(Error::EmptyQuery.surface_code(), "INVALID_INPUT");
        assert_eq!(
            Error::CollectionNotFound("c1".into()).surface_code(),
            "COLLECTION_NOT_FOUND"
        );
        assert_eq!(
            Error::UnsupportedType("image/png".into()).surface_code(),
            "UNSUPPORTED_TYPE"
        );
        assert_eq!(
            Error::Embedding("down".into()).surface_code(),
            "EMBEDDING_ERROR"
        );
        assert_eq!(
            Error::FileTooLarge {
                size: 100,
                limit: 50
            }
            .surface_code(),
            "FILE_TOO_LARGE"
        );
    }
}
