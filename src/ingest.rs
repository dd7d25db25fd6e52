//! Ingestion orchestration: the per-document state machine.
//!
//! ```text
//! pending → extracting → chunking → embedding → complete
//!                                                    ↘ error (terminal until restart)
//! ```
//!
//! Each stage transition is persisted before the stage runs, so a crash
//! leaves an honest status behind. Chunk insertion replaces any prior
//! chunks for the document inside one transaction; re-ingesting a document
//! is therefore idempotent. Embedding runs in sequential batches within a
//! document, while a shared semaphore bounds how many documents are in
//! flight across the system.
//!
//! Cancellation is checked between stages and between embedding batches;
//! a cancelled ingest rolls the document back to `pending` rather than
//! leaving it half-complete.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::{self, ChunkerConfig};
use crate::config::Config;
use crate::embedding::{ContentContext, ContentKind, EmbeddingRouter};
use crate::error::{Error, Result};
use crate::extract;
use crate::files;
use crate::models::{Chunk, Document, DocumentStatus, Metadata};
use crate::store::Store;

/// Drives documents through the ingestion pipeline.
#[derive(Clone)]
pub struct IngestOrchestrator {
    store: Store,
    router: EmbeddingRouter,
    storage_root: PathBuf,
    chunker: ChunkerConfig,
    batch_size: usize,
    semaphore: Arc<Semaphore>,
}

impl IngestOrchestrator {
    pub fn new(store: Store, router: EmbeddingRouter, config: &Config) -> Self {
        Self {
            store,
            router,
            storage_root: config.storage.path.clone(),
            chunker: ChunkerConfig::default(),
            batch_size: config.embedding.batch_size.clamp(1, 64),
            semaphore: Arc::new(Semaphore::new(config.ingest.max_concurrent)),
        }
    }

    /// Process one document end to end, bounded by the shared concurrency
    /// limit. Idempotent on success: re-running replaces all chunks.
    pub async fn ingest(&self, document_id: &str, cancel: &CancellationToken) -> Result<()> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;

        match self.run_pipeline(document_id, cancel).await {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => {
                // Leave the document recoverable.
                let _ = self
                    .store
                    .set_document_status(document_id, DocumentStatus::Pending)
                    .await;
                Err(Error::Cancelled)
            }
            Err(e) => {
                warn!(document_id, error = %e, "ingest failed");
                let _ = self.store.set_document_error(document_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Spawn ingestion in the background (crawler and upload hand-off).
    pub fn ingest_detached(&self, document_id: String, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.ingest(&document_id, &cancel).await;
        });
    }

    /// Reset a failed document and run the pipeline again.
    pub async fn restart(&self, document_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.store
            .set_document_status(document_id, DocumentStatus::Pending)
            .await?;
        self.ingest(document_id, cancel).await
    }

    async fn run_pipeline(&self, document_id: &str, cancel: &CancellationToken) -> Result<()> {
        let doc = self.store.get_document(document_id).await?;

        // ---- extracting ----
        self.store
            .set_document_status(document_id, DocumentStatus::Extracting)
            .await?;

        let bytes = self.load_payload(&doc).await?;
        let content_type = doc.content_type.clone();
        let extracted =
            tokio::task::spawn_blocking(move || extract::extract(&bytes, &content_type))
                .await
                .map_err(|e| Error::Extraction {
                    stage: "task",
                    message: e.to_string(),
                })??;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // ---- chunking ----
        self.store
            .set_document_status(document_id, DocumentStatus::Chunking)
            .await?;

        let drafts = chunker::chunk_text(&extracted.text, &doc.metadata, &self.chunker);
        if drafts.is_empty() {
            return Err(Error::Chunking("document produced no text".to_string()));
        }
        debug!(document_id, chunks = drafts.len(), "chunked");

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // ---- embedding ----
        self.store
            .set_document_status(document_id, DocumentStatus::Embedding)
            .await?;

        let context = ContentContext {
            kind: content_kind(&doc.metadata),
            language: doc.metadata.language.clone(),
            collection_id: Some(doc.collection_id.clone()),
        };

        let established = self
            .store
            .collection_embedding_identity(&doc.collection_id)
            .await?;

        let mut chunks: Vec<Chunk> = Vec::with_capacity(drafts.len());
        let mut identity: Option<(String, String, usize)> = None;

        for batch in drafts.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let embedded = self.router.embed_batch(&texts, Some(&context), None).await?;

            for (draft, emb) in batch.iter().zip(embedded.into_iter()) {
                if emb.vector.len() != emb.dimensions {
                    return Err(Error::Embedding(format!(
                        "{} returned {} dims, expected {}",
                        emb.provider_id,
                        emb.vector.len(),
                        emb.dimensions
                    )));
                }
                // A collection must not mix embedding dimensions.
                if let Some((_, dims)) = &established {
                    if emb.dimensions != *dims {
                        return Err(Error::Embedding(format!(
                            "dimension mismatch: collection uses {} dims, {} produced {}",
                            dims, emb.provider_id, emb.dimensions
                        )));
                    }
                }

                identity = Some((
                    emb.provider_id.clone(),
                    emb.model_id.clone(),
                    emb.dimensions,
                ));

                let mut metadata = draft.metadata.clone();
                metadata.embedding_provider = Some(emb.provider_id);
                metadata.embedding_model = Some(emb.model_id.clone());
                metadata.embedding_dimensions = Some(emb.dimensions);

                chunks.push(Chunk {
                    id: 0,
                    document_id: document_id.to_string(),
                    chunk_index: draft.chunk_index,
                    text: draft.text.clone(),
                    token_count: draft.token_count,
                    embedding: emb.vector,
                    embedding_model: emb.model_id,
                    metadata,
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // ---- store + complete ----
        self.store.replace_chunks(document_id, &chunks).await?;

        let mut metadata = doc.metadata.clone();
        if let Some((provider, model, dims)) = identity {
            metadata.embedding_provider = Some(provider);
            metadata.embedding_model = Some(model);
            metadata.embedding_dimensions = Some(dims);
        }
        self.store.set_document_complete(document_id, &metadata).await?;

        info!(document_id, chunks = chunks.len(), "ingest complete");
        Ok(())
    }

    async fn load_payload(&self, doc: &Document) -> Result<Vec<u8>> {
        let path = doc.file_path.as_ref().ok_or_else(|| Error::Extraction {
            stage: "load",
            message: "document has no stored file".to_string(),
        })?;
        files::read_file(std::path::Path::new(path))
            .await
            .map_err(|e| Error::Extraction {
                stage: "load",
                message: e.to_string(),
            })
    }

    pub fn storage_root(&self) -> &std::path::Path {
        &self.storage_root
    }
}

/// Map document metadata to a routing content kind.
fn content_kind(meta: &Metadata) -> Option<ContentKind> {
    match meta.doc_type.as_deref() {
        Some("code") => Some(ContentKind::Code),
        Some("personal") => Some(ContentKind::Personal),
        Some(_) => Some(ContentKind::Docs),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::costs::{CostTracker, RuntimeOverrides};
    use crate::db;
    use crate::migrate;

    async fn orchestrator(config: &Config) -> (IngestOrchestrator, Store) {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let store = Store::new(pool);
        let costs = CostTracker::new(
            store.clone(),
            config.budget.clone(),
            RuntimeOverrides::new(),
        );
        let router = EmbeddingRouter::new(config.embedding.clone(), costs).unwrap();
        (
            IngestOrchestrator::new(store.clone(), router, config),
            store,
        )
    }

    #[test]
    fn content_kind_mapping() {
        let mut meta = Metadata::default();
        assert_eq!(content_kind(&meta), None);

        meta.doc_type = Some("code".to_string());
        assert_eq!(content_kind(&meta), Some(ContentKind::Code));

        meta.doc_type = Some("personal".to_string());
        assert_eq!(content_kind(&meta), Some(ContentKind::Personal));

        meta.doc_type = Some("guide".to_string());
        assert_eq!(content_kind(&meta), Some(ContentKind::Docs));
    }

    #[tokio::test]
    async fn missing_file_marks_document_error() {
        let config = Config::default();
        let (orchestrator, store) = orchestrator(&config).await;

        let col = store.create_collection("c", None).await.unwrap();
        let doc = store
            .create_document(
                &col.id,
                "d",
                "text/plain",
                0,
                None,
                Some("/nonexistent/file.txt"),
                &Metadata::default(),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let result = orchestrator.ingest(&doc.id, &cancel).await;
        assert!(result.is_err());

        let doc = store.get_document(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
        assert!(doc.error_message.is_some());
    }

    #[tokio::test]
    async fn document_without_file_is_error_with_message() {
        let config = Config::default();
        let (orchestrator, store) = orchestrator(&config).await;

        let col = store.create_collection("c", None).await.unwrap();
        let doc = store
            .create_document(&col.id, "d", "text/plain", 0, None, None, &Metadata::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        assert!(orchestrator.ingest(&doc.id, &cancel).await.is_err());

        let doc = store.get_document(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
        assert!(doc
            .error_message
            .as_deref()
            .unwrap()
            .contains("no stored file"));
    }

    #[tokio::test]
    async fn pre_cancelled_ingest_leaves_document_recoverable() {
        let config = Config::default();
        let (orchestrator, store) = orchestrator(&config).await;

        let tmp = tempfile::TempDir::new().unwrap();
        let col = store.create_collection("c", None).await.unwrap();
        let path = tmp.path().join("doc.txt");
        std::fs::write(&path, "Some real content.\n\nMore content.").unwrap();

        let doc = store
            .create_document(
                &col.id,
                "d",
                "text/plain",
                0,
                None,
                Some(path.to_str().unwrap()),
                &Metadata::default(),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = orchestrator.ingest(&doc.id, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        let doc = store.get_document(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
    }
}
