//! Storage gateway: typed queries over the SQLite pool.
//!
//! Every persistent operation in the backend goes through this module:
//! collection and document CRUD, transactional chunk replacement, the
//! vector and full-text candidate queries, and the cost ledger. Multi-row
//! writes for a single document happen inside one transaction; deletes
//! cascade through foreign keys.
//!
//! Vector search is a cosine scan over per-collection chunk BLOBs. The
//! scan is brute-force; swapping in an ANN index changes only
//! [`Store::vector_query`].

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{
    AlertType, BudgetAlert, Chunk, Citation, Collection, CostRecord, Document, DocumentStatus,
    Metadata, SearchResult, now_ts,
};

/// Typed storage operations over a shared pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Collection summary row for list endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectionSummary {
    #[serde(flatten)]
    pub collection: Collection,
    pub document_count: i64,
}

/// Raw full-text candidate: result plus its engine rank score.
#[derive(Debug, Clone)]
pub struct FtsCandidate {
    pub result: SearchResult,
    pub raw_rank: f64,
}

/// Spend breakdown bucket per `(provider, operation)`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageBreakdown {
    pub provider: String,
    pub operation: String,
    pub request_count: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub avg_cost_per_request: f64,
}

fn map_db_err(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref db) = e {
        let msg = db.message();
        if msg.contains("UNIQUE constraint") || msg.contains("FOREIGN KEY constraint") {
            return Error::Conflict(msg.to_string());
        }
    }
    Error::Storage(e)
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Collections ============

    pub async fn create_collection(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Collection> {
        let id = Uuid::new_v4().to_string();
        let now = now_ts();

        sqlx::query(
            "INSERT INTO collections (id, name, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        Ok(Collection {
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_collection(&self, id: &str) -> Result<Collection> {
        let row = sqlx::query(
            "SELECT id, name, description, created_at, updated_at FROM collections WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::CollectionNotFound(id.to_string()))?;

        Ok(Collection {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.name, c.description, c.created_at, c.updated_at,
                   COUNT(d.id) AS document_count
            FROM collections c
            LEFT JOIN documents d ON d.collection_id = c.id
            GROUP BY c.id
            ORDER BY c.created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CollectionSummary {
                collection: Collection {
                    id: row.get("id"),
                    name: row.get("name"),
                    description: row.get("description"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                },
                document_count: row.get("document_count"),
            })
            .collect())
    }

    pub async fn collection_chunk_total(&self, collection_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.collection_id = ?
            "#,
        )
        .bind(collection_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete a collection and everything it owns. Returns the file paths
    /// of its documents so the caller can remove stored files.
    pub async fn delete_collection(&self, id: &str) -> Result<Vec<String>> {
        // Confirm it exists first for a clean 404.
        self.get_collection(id).await?;

        let paths: Vec<String> = sqlx::query_scalar(
            "SELECT file_path FROM documents WHERE collection_id = ? AND file_path IS NOT NULL",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE collection_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        // documents + chunks cascade from the collection row
        sqlx::query("DELETE FROM collections WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(paths)
    }

    // ============ Documents ============

    #[allow(clippy::too_many_arguments)]
    pub async fn create_document(
        &self,
        collection_id: &str,
        title: &str,
        content_type: &str,
        file_size: i64,
        source_url: Option<&str>,
        file_path: Option<&str>,
        metadata: &Metadata,
    ) -> Result<Document> {
        // Surface a 404 rather than a foreign-key conflict.
        self.get_collection(collection_id).await?;

        let id = Uuid::new_v4().to_string();
        let now = now_ts();

        sqlx::query(
            r#"
            INSERT INTO documents
                (id, collection_id, title, content_type, file_size, source_url, file_path,
                 status, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(collection_id)
        .bind(title)
        .bind(content_type)
        .bind(file_size)
        .bind(source_url)
        .bind(file_path)
        .bind(metadata.to_json())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        Ok(Document {
            id,
            collection_id: collection_id.to_string(),
            title: title.to_string(),
            content_type: content_type.to_string(),
            file_size,
            source_url: source_url.map(str::to_string),
            file_path: file_path.map(str::to_string),
            status: DocumentStatus::Pending,
            error_message: None,
            metadata: metadata.clone(),
            created_at: now,
            processed_at: None,
            updated_at: now,
        })
    }

    pub async fn get_document(&self, id: &str) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;

        Ok(document_from_row(&row))
    }

    pub async fn list_documents(
        &self,
        collection_id: &str,
        status: Option<DocumentStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Document>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM documents WHERE collection_id = ? AND status = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(collection_id)
                .bind(s.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM documents WHERE collection_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(collection_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(document_from_row).collect())
    }

    pub async fn set_document_file(&self, id: &str, file_path: &str, file_size: i64) -> Result<()> {
        let res = sqlx::query(
            "UPDATE documents SET file_path = ?, file_size = ?, updated_at = ? WHERE id = ?",
        )
        .bind(file_path)
        .bind(file_size)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_document_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        let res = sqlx::query(
            "UPDATE documents SET status = ?, error_message = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_document_error(&self, id: &str, message: &str) -> Result<()> {
        // Keep error messages bounded; provider payloads can be huge.
        let truncated: String = message.chars().take(500).collect();
        sqlx::query(
            "UPDATE documents SET status = 'error', error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(truncated)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_document_complete(&self, id: &str, metadata: &Metadata) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE documents
            SET status = 'complete', error_message = NULL, metadata = ?,
                processed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(metadata.to_json())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a document and its chunks. Returns the stored file path, if
    /// any, so the caller can unlink it.
    pub async fn delete_document(&self, id: &str) -> Result<Option<String>> {
        let doc = self.get_document(id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(doc.file_path)
    }

    pub async fn chunk_count(&self, document_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// The embedding identity of a collection, inferred from the most
    /// recently processed document. Search embeds queries with this
    /// provider so query vectors match chunk vectors.
    pub async fn collection_embedding_identity(
        &self,
        collection_id: &str,
    ) -> Result<Option<(String, usize)>> {
        let row: Option<String> = sqlx::query_scalar(
            r#"
            SELECT metadata FROM documents
            WHERE collection_id = ? AND status = 'complete'
            ORDER BY processed_at DESC
            LIMIT 1
            "#,
        )
        .bind(collection_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|raw| {
            let meta = Metadata::from_json(&raw);
            match (meta.embedding_provider, meta.embedding_dimensions) {
                (Some(p), Some(d)) => Some((p, d)),
                _ => None,
            }
        }))
    }

    // ============ Chunks ============

    /// Replace all chunks for a document in one transaction: prior chunks
    /// (and their FTS rows) are deleted, then the new set is inserted.
    /// Either the full replacement lands or nothing changes.
    pub async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let collection_id: String =
            sqlx::query_scalar("SELECT collection_id FROM documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;

        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let blob = vec_to_blob(&chunk.embedding);
            let res = sqlx::query(
                r#"
                INSERT INTO chunks
                    (document_id, chunk_index, text, token_count, embedding,
                     embedding_model, metadata, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(blob)
            .bind(&chunk.embedding_model)
            .bind(chunk.metadata.to_json())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

            let chunk_id = res.last_insert_rowid();
            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, document_id, collection_id, text) VALUES (?, ?, ?, ?)",
            )
            .bind(chunk_id)
            .bind(document_id)
            .bind(&collection_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ============ Vector search ============

    /// Cosine-similarity scan over a collection's chunks. Returns results
    /// with `similarity >= min_similarity`, best first, at most `top_k`.
    pub async fn vector_query(
        &self,
        collection_id: &str,
        query_vec: &[f32],
        top_k: usize,
        min_similarity: f64,
    ) -> Result<Vec<SearchResult>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.text, c.embedding, c.metadata AS chunk_metadata,
                   d.id AS document_id, d.title, d.source_url
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.collection_id = ?
            "#,
        )
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;

        let mut results: Vec<SearchResult> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                let similarity = cosine_similarity(query_vec, &vec) as f64;
                if similarity < min_similarity {
                    return None;
                }
                Some(result_from_row(row, similarity))
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(top_k);
        Ok(results)
    }

    // ============ Full-text search ============

    /// BM25-ranked full-text query. `match_expr` must already be a valid
    /// FTS match expression (see the search module for sanitization).
    /// Results come back best-first with the raw engine rank attached.
    pub async fn fts_query(
        &self,
        collection_id: &str,
        match_expr: &str,
        top_k: usize,
    ) -> Result<Vec<FtsCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT f.chunk_id, f.rank, c.text, c.metadata AS chunk_metadata,
                   d.id AS document_id, d.title, d.source_url
            FROM chunks_fts f
            JOIN chunks c ON c.id = f.chunk_id
            JOIN documents d ON d.id = f.document_id
            WHERE chunks_fts MATCH ? AND f.collection_id = ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(match_expr)
        .bind(collection_id)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                // FTS5 rank is negative (lower = better); negate to positive.
                let rank: f64 = row.get("rank");
                FtsCandidate {
                    result: result_from_row(row, 0.0),
                    raw_rank: -rank,
                }
            })
            .collect())
    }

    // ============ Cost ledger ============

    pub async fn insert_cost(&self, record: &CostRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_usage
                (provider, operation, tokens_used, cost_usd, model, collection_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.provider)
        .bind(record.operation.as_str())
        .bind(record.tokens_used)
        .bind(record.cost_usd)
        .bind(&record.model)
        .bind(&record.collection_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Total spend since the given unix timestamp.
    pub async fn spend_since(&self, since_ts: i64) -> Result<f64> {
        let total: Option<f64> = sqlx::query_scalar(
            "SELECT SUM(cost_usd) FROM api_usage WHERE created_at >= ?",
        )
        .bind(since_ts)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0.0))
    }

    /// Per-(provider, operation) breakdown over `[start_ts, end_ts)`.
    pub async fn usage_breakdown(&self, start_ts: i64, end_ts: i64) -> Result<Vec<UsageBreakdown>> {
        let rows = sqlx::query(
            r#"
            SELECT provider, operation,
                   COUNT(*) AS request_count,
                   SUM(tokens_used) AS total_tokens,
                   SUM(cost_usd) AS total_cost
            FROM api_usage
            WHERE created_at >= ? AND created_at < ?
            GROUP BY provider, operation
            ORDER BY total_cost DESC
            "#,
        )
        .bind(start_ts)
        .bind(end_ts)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let request_count: i64 = row.get("request_count");
                let total_cost: f64 = row.get::<Option<f64>, _>("total_cost").unwrap_or(0.0);
                UsageBreakdown {
                    provider: row.get("provider"),
                    operation: row.get("operation"),
                    request_count,
                    total_tokens: row.get::<Option<i64>, _>("total_tokens").unwrap_or(0),
                    total_cost,
                    avg_cost_per_request: if request_count > 0 {
                        total_cost / request_count as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect())
    }

    // ============ Budget alerts ============

    /// True when an alert of this type/period was recorded within the
    /// trailing window.
    pub async fn alert_within(
        &self,
        alert_type: AlertType,
        period: &str,
        window_secs: i64,
    ) -> Result<bool> {
        let cutoff = now_ts() - window_secs;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM budget_alerts WHERE alert_type = ? AND period = ? AND triggered_at >= ?",
        )
        .bind(alert_type.as_str())
        .bind(period)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn insert_alert(&self, alert: &BudgetAlert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO budget_alerts
                (alert_type, period, threshold_usd, current_spend_usd, triggered_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.alert_type.as_str())
        .bind(&alert.period)
        .bind(alert.threshold_usd)
        .bind(alert.current_spend_usd)
        .bind(alert.triggered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_alerts(&self, limit: i64) -> Result<Vec<BudgetAlert>> {
        let rows = sqlx::query(
            "SELECT alert_type, period, threshold_usd, current_spend_usd, triggered_at FROM budget_alerts ORDER BY triggered_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let alert_type = match row.get::<String, _>("alert_type").as_str() {
                    "warning" => AlertType::Warning,
                    "limit_reached" => AlertType::LimitReached,
                    _ => return None,
                };
                Some(BudgetAlert {
                    alert_type,
                    period: row.get("period"),
                    threshold_usd: row.get("threshold_usd"),
                    current_spend_usd: row.get("current_spend_usd"),
                    triggered_at: row.get("triggered_at"),
                })
            })
            .collect())
    }
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Document {
    let status_str: String = row.get("status");
    let metadata_raw: String = row.get("metadata");
    Document {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        title: row.get("title"),
        content_type: row.get("content_type"),
        file_size: row.get("file_size"),
        source_url: row.get("source_url"),
        file_path: row.get("file_path"),
        status: DocumentStatus::parse(&status_str).unwrap_or(DocumentStatus::Error),
        error_message: row.get("error_message"),
        metadata: Metadata::from_json(&metadata_raw),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
        updated_at: row.get("updated_at"),
    }
}

fn result_from_row(row: &sqlx::sqlite::SqliteRow, similarity: f64) -> SearchResult {
    let metadata_raw: String = row.get("chunk_metadata");
    let metadata = Metadata::from_json(&metadata_raw);
    let title: String = row.get("title");

    SearchResult {
        chunk_id: row.get("chunk_id"),
        text: row.get("text"),
        similarity,
        document_id: row.get("document_id"),
        doc_title: title.clone(),
        source_url: row.get("source_url"),
        citation: Citation {
            title,
            page: metadata.page,
            section: metadata.section.clone(),
        },
        metadata,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    async fn test_store() -> Store {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        Store::new(pool)
    }

    fn make_chunk(document_id: &str, index: i64, text: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: 0,
            document_id: document_id.to_string(),
            chunk_index: index,
            text: text.to_string(),
            token_count: (text.len() as i64 + 3) / 4,
            embedding,
            embedding_model: "test-model".to_string(),
            metadata: Metadata::default(),
        }
    }

    #[tokio::test]
    async fn collection_crud_and_not_found() {
        let store = test_store().await;
        let col = store.create_collection("docs", Some("test")).await.unwrap();
        assert_eq!(store.get_collection(&col.id).await.unwrap().name, "docs");

        let missing = store.get_collection("nope").await;
        assert!(matches!(missing, Err(Error::CollectionNotFound(_))));

        store.delete_collection(&col.id).await.unwrap();
        assert!(store.get_collection(&col.id).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_chunk_index_is_conflict() {
        let store = test_store().await;
        let col = store.create_collection("c", None).await.unwrap();
        let doc = store
            .create_document(&col.id, "d", "text/plain", 1, None, None, &Metadata::default())
            .await
            .unwrap();

        let chunks = vec![
            make_chunk(&doc.id, 0, "a", vec![1.0]),
            make_chunk(&doc.id, 0, "b", vec![1.0]),
        ];
        let err = store.replace_chunks(&doc.id, &chunks).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Failed replacement must not leave partial state.
        assert_eq!(store.chunk_count(&doc.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replace_chunks_is_atomic_swap() {
        let store = test_store().await;
        let col = store.create_collection("c", None).await.unwrap();
        let doc = store
            .create_document(&col.id, "d", "text/plain", 1, None, None, &Metadata::default())
            .await
            .unwrap();

        let first = vec![
            make_chunk(&doc.id, 0, "one", vec![1.0, 0.0]),
            make_chunk(&doc.id, 1, "two", vec![0.0, 1.0]),
        ];
        store.replace_chunks(&doc.id, &first).await.unwrap();
        assert_eq!(store.chunk_count(&doc.id).await.unwrap(), 2);

        let second = vec![make_chunk(&doc.id, 0, "only", vec![1.0, 1.0])];
        store.replace_chunks(&doc.id, &second).await.unwrap();
        assert_eq!(store.chunk_count(&doc.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn vector_query_filters_and_orders() {
        let store = test_store().await;
        let col = store.create_collection("c", None).await.unwrap();
        let doc = store
            .create_document(&col.id, "d", "text/plain", 1, None, None, &Metadata::default())
            .await
            .unwrap();

        let chunks = vec![
            make_chunk(&doc.id, 0, "aligned", vec![1.0, 0.0]),
            make_chunk(&doc.id, 1, "diagonal", vec![0.7, 0.7]),
            make_chunk(&doc.id, 2, "orthogonal", vec![0.0, 1.0]),
        ];
        store.replace_chunks(&doc.id, &chunks).await.unwrap();

        let results = store
            .vector_query(&col.id, &[1.0, 0.0], 10, 0.5)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "aligned");
        assert!(results[0].similarity > results[1].similarity);
    }

    #[tokio::test]
    async fn fts_query_ranks_matches() {
        let store = test_store().await;
        let col = store.create_collection("c", None).await.unwrap();
        let doc = store
            .create_document(&col.id, "d", "text/plain", 1, None, None, &Metadata::default())
            .await
            .unwrap();

        let chunks = vec![
            make_chunk(&doc.id, 0, "setup authentication for the api", vec![1.0]),
            make_chunk(&doc.id, 1, "deployment notes and runbooks", vec![1.0]),
        ];
        store.replace_chunks(&doc.id, &chunks).await.unwrap();

        let hits = store
            .fts_query(&col.id, r#""authentication"*"#, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].result.text.contains("authentication"));
        assert!(hits[0].raw_rank > 0.0);
    }

    #[tokio::test]
    async fn document_delete_cascades_chunks() {
        let store = test_store().await;
        let col = store.create_collection("c", None).await.unwrap();
        let doc = store
            .create_document(&col.id, "d", "text/plain", 1, None, None, &Metadata::default())
            .await
            .unwrap();
        store
            .replace_chunks(&doc.id, &[make_chunk(&doc.id, 0, "text", vec![1.0])])
            .await
            .unwrap();

        store.delete_document(&doc.id).await.unwrap();
        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn collection_identity_from_latest_complete_doc() {
        let store = test_store().await;
        let col = store.create_collection("c", None).await.unwrap();
        let doc = store
            .create_document(&col.id, "d", "text/plain", 1, None, None, &Metadata::default())
            .await
            .unwrap();

        assert!(store
            .collection_embedding_identity(&col.id)
            .await
            .unwrap()
            .is_none());

        let mut meta = Metadata::default();
        meta.embedding_provider = Some("local".to_string());
        meta.embedding_dimensions = Some(768);
        store.set_document_complete(&doc.id, &meta).await.unwrap();

        let identity = store
            .collection_embedding_identity(&col.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity, ("local".to_string(), 768));
    }

    #[tokio::test]
    async fn alert_dedupe_window() {
        let store = test_store().await;
        let alert = BudgetAlert {
            alert_type: AlertType::Warning,
            period: "monthly".to_string(),
            threshold_usd: 0.8,
            current_spend_usd: 0.9,
            triggered_at: now_ts(),
        };
        assert!(!store
            .alert_within(AlertType::Warning, "monthly", 86_400)
            .await
            .unwrap());
        store.insert_alert(&alert).await.unwrap();
        assert!(store
            .alert_within(AlertType::Warning, "monthly", 86_400)
            .await
            .unwrap());
        // A different type is unaffected.
        assert!(!store
            .alert_within(AlertType::LimitReached, "monthly", 86_400)
            .await
            .unwrap());
    }
}
