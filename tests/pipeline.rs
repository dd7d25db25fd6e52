//! Integration tests over the storage and retrieval pipeline.
//!
//! These run entirely against an in-memory SQLite database with
//! hand-built embeddings, so they exercise the storage gateway, both
//! search legs, fusion, rescoring, and the synthesis math without any
//! network or model downloads.

use docsynth::chunker::{chunk_text, ChunkerConfig};
use docsynth::db;
use docsynth::migrate;
use docsynth::models::{Chunk, DocumentStatus, Metadata, SourceQuality};
use docsynth::rescore;
use docsynth::search::{build_match_expression, fuse, resolve_weights};
use docsynth::store::Store;
use docsynth::synthesis::{cluster_count, kmeans, recommend, select_pairs};

async fn test_store() -> Store {
    let pool = db::connect_memory().await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    Store::new(pool)
}

fn chunk(document_id: &str, index: i64, text: &str, embedding: Vec<f32>) -> Chunk {
    Chunk {
        id: 0,
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        token_count: (text.chars().count() as i64 + 3) / 4,
        embedding,
        embedding_model: "test-model".to_string(),
        metadata: Metadata::default(),
    }
}

/// A document chunked and stored through the real chunker keeps the
/// chunk-index invariant: contiguous from zero, at least one chunk.
#[tokio::test]
async fn chunked_document_has_contiguous_indices() {
    let store = test_store().await;
    let col = store.create_collection("docs", None).await.unwrap();
    let doc = store
        .create_document(&col.id, "guide", "text/plain", 0, None, None, &Metadata::default())
        .await
        .unwrap();

    let text = (0..30)
        .map(|i| format!("Paragraph {} about configuration and deployment.", i))
        .collect::<Vec<_>>()
        .join("\n\n");
    let drafts = chunk_text(&text, &Metadata::default(), &ChunkerConfig { max_size: 200, overlap: 40 });
    assert!(drafts.len() >= 3);

    let chunks: Vec<Chunk> = drafts
        .iter()
        .map(|d| chunk(&doc.id, d.chunk_index, &d.text, vec![1.0, 0.0]))
        .collect();
    store.replace_chunks(&doc.id, &chunks).await.unwrap();

    let count = store.chunk_count(&doc.id).await.unwrap();
    assert_eq!(count as usize, drafts.len());
    for (i, d) in drafts.iter().enumerate() {
        assert_eq!(d.chunk_index, i as i64);
    }
}

/// Re-ingesting replaces chunks wholesale instead of accumulating.
#[tokio::test]
async fn reingest_replaces_chunks() {
    let store = test_store().await;
    let col = store.create_collection("docs", None).await.unwrap();
    let doc = store
        .create_document(&col.id, "d", "text/plain", 0, None, None, &Metadata::default())
        .await
        .unwrap();

    let first: Vec<Chunk> = (0..5)
        .map(|i| chunk(&doc.id, i, &format!("first pass {}", i), vec![1.0]))
        .collect();
    store.replace_chunks(&doc.id, &first).await.unwrap();

    let second: Vec<Chunk> = (0..2)
        .map(|i| chunk(&doc.id, i, &format!("second pass {}", i), vec![1.0]))
        .collect();
    store.replace_chunks(&doc.id, &second).await.unwrap();

    assert_eq!(store.chunk_count(&doc.id).await.unwrap(), 2);

    // FTS only matches the current generation.
    let old = store
        .fts_query(&col.id, &build_match_expression("first").unwrap(), 10)
        .await
        .unwrap();
    assert!(old.is_empty());
    let new = store
        .fts_query(&col.id, &build_match_expression("second").unwrap(), 10)
        .await
        .unwrap();
    assert_eq!(new.len(), 2);
}

/// A chunk ranked first by both legs gets the canonical RRF score
/// `w_vec/(k+1) + w_bm25/(k+1)` and `source = "both"`.
#[tokio::test]
async fn hybrid_agreement_scores_sum_of_legs() {
    let store = test_store().await;
    let col = store.create_collection("docs", None).await.unwrap();
    let doc = store
        .create_document(&col.id, "auth guide", "text/plain", 0, None, None, &Metadata::default())
        .await
        .unwrap();

    let chunks = vec![
        chunk(&doc.id, 0, "setup authentication for the service", vec![1.0, 0.0]),
        chunk(&doc.id, 1, "database deployment checklist", vec![0.0, 1.0]),
        chunk(&doc.id, 2, "authentication tokens and rotation", vec![0.9, 0.1]),
    ];
    store.replace_chunks(&doc.id, &chunks).await.unwrap();

    // Vector leg: query vector aligned with chunk 0.
    let vector_results = store
        .vector_query(&col.id, &[1.0, 0.0], 10, 0.5)
        .await
        .unwrap();
    assert_eq!(vector_results[0].text, "setup authentication for the service");

    // BM25 leg: exact phrase terms match chunk 0 best.
    let expr = build_match_expression("setup authentication").unwrap();
    let fts = store.fts_query(&col.id, &expr, 10).await.unwrap();
    assert_eq!(fts.len(), 1);

    let max_raw = fts.iter().map(|c| c.raw_rank).fold(1.0f64, f64::max);
    let bm25_results: Vec<_> = fts
        .into_iter()
        .map(|c| {
            let mut r = c.result;
            r.bm25_score = Some(c.raw_rank / max_raw);
            r
        })
        .collect();

    let weights = resolve_weights(Some((0.7, 0.3)), (0.7, 0.3));
    let fused = fuse(vector_results, bm25_results, weights, 60.0);

    // Top chunk appears at rank 0 in both legs.
    let top = &fused[0];
    assert_eq!(top.text, "setup authentication for the service");
    assert_eq!(
        top.source,
        Some(docsynth::models::FusionSource::Both)
    );
    let expected = 0.7 / 61.0 + 0.3 / 61.0;
    assert!((top.fused_score.unwrap() - expected).abs() < 1e-9);
    assert!((top.fused_score.unwrap() - 1.0 / 61.0).abs() < 1e-9);
}

/// Trust rescoring re-orders equal-similarity results by metadata alone.
#[tokio::test]
async fn trust_rescoring_reorders_stored_results() {
    let store = test_store().await;
    let col = store.create_collection("docs", None).await.unwrap();
    let doc = store
        .create_document(&col.id, "d", "text/plain", 0, None, None, &Metadata::default())
        .await
        .unwrap();

    let mut community = Metadata::default();
    community.source_quality = Some(SourceQuality::Community);
    let mut official = Metadata::default();
    official.source_quality = Some(SourceQuality::Official);

    let mut c0 = chunk(&doc.id, 0, "community answer", vec![1.0, 0.0]);
    c0.metadata = community;
    let mut c1 = chunk(&doc.id, 1, "official answer", vec![1.0, 0.0]);
    c1.metadata = official;
    store.replace_chunks(&doc.id, &[c0, c1]).await.unwrap();

    let mut results = store
        .vector_query(&col.id, &[1.0, 0.0], 10, 0.5)
        .await
        .unwrap();
    // Identical vectors, identical similarity before rescoring.
    assert_eq!(results.len(), 2);
    assert!((results[0].similarity - results[1].similarity).abs() < 1e-9);

    rescore::rescore(&mut results);
    assert_eq!(results[0].text, "official answer");
    assert!(results[0].similarity > results[1].similarity);
    assert!(results[0].trust_weight.unwrap() > results[1].trust_weight.unwrap());
}

/// Nine results in three clean semantic groups produce three clusters,
/// and the conflict penalty can flip the recommendation.
#[test]
fn synthesis_grouping_and_recommendation() {
    assert_eq!(cluster_count(9), 3);

    // Initial centroids are the first k vectors, so the leading three
    // span the three semantic groups.
    let vectors: Vec<Vec<f32>> = vec![
        vec![1.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![0.0, 0.0, 1.0],
        vec![0.98, 0.02, 0.0],
        vec![0.02, 0.98, 0.0],
        vec![0.04, 0.0, 0.96],
        vec![0.96, 0.04, 0.0],
        vec![0.0, 0.96, 0.04],
        vec![0.0, 0.02, 0.98],
    ];
    let (assignments, centroids) = kmeans(&vectors, 3);
    assert_eq!(centroids.len(), 3);

    let mut cluster_sizes = [0usize; 3];
    for &a in &assignments {
        cluster_sizes[a] += 1;
    }
    assert_eq!(cluster_sizes, [3, 3, 3]);

    // Recommendation: highest consensus wins until a conflict penalty
    // drags it below the runner-up.
    use docsynth::synthesis::{Approach, ApproachSource, Conflict};
    let approach = |topic: &str, consensus: f64, source: &str| Approach {
        topic: topic.to_string(),
        method: topic.to_string(),
        summary: format!("summary of {}", topic),
        sources: vec![ApproachSource {
            title: source.to_string(),
            url: None,
            snippet: String::new(),
        }],
        consensus,
    };
    let approaches = vec![
        approach("a", 0.82, "src-a"),
        approach("b", 0.75, "src-b"),
        approach("c", 0.60, "src-c"),
    ];
    assert_eq!(recommend(&approaches, &[]), Some(0));

    let conflicts = vec![Conflict {
        topic: "a".to_string(),
        severity: "high".to_string(),
        confidence: 0.9,
        description: "contradicts".to_string(),
        source_a: "src-a".to_string(),
        source_b: "src-x".to_string(),
    }];
    // 0.82 - 0.3 < 0.75: second approach becomes recommended.
    assert_eq!(recommend(&approaches, &conflicts), Some(1));

    // Pair selection needs overlap inside the band.
    let pairs = select_pairs(&approaches, 0.2, 0.7, 6);
    assert!(pairs.len() <= 6);
}

/// Deleting a collection removes documents and chunks transactionally.
#[tokio::test]
async fn collection_delete_cascades() {
    let store = test_store().await;
    let col = store.create_collection("docs", None).await.unwrap();
    let doc = store
        .create_document(&col.id, "d", "text/plain", 0, None, None, &Metadata::default())
        .await
        .unwrap();
    store
        .replace_chunks(&doc.id, &[chunk(&doc.id, 0, "text body", vec![1.0])])
        .await
        .unwrap();

    store.delete_collection(&col.id).await.unwrap();

    assert!(store.get_document(&doc.id).await.is_err());
    let leftover = store
        .fts_query(&col.id, &build_match_expression("text").unwrap(), 10)
        .await
        .unwrap();
    assert!(leftover.is_empty());
}

/// Status transitions persist and the complete stamp carries metadata.
#[tokio::test]
async fn status_machine_persists() {
    let store = test_store().await;
    let col = store.create_collection("docs", None).await.unwrap();
    let doc = store
        .create_document(&col.id, "d", "text/plain", 0, None, None, &Metadata::default())
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);

    for status in [
        DocumentStatus::Extracting,
        DocumentStatus::Chunking,
        DocumentStatus::Embedding,
    ] {
        store.set_document_status(&doc.id, status).await.unwrap();
        assert_eq!(store.get_document(&doc.id).await.unwrap().status, status);
    }

    let mut meta = Metadata::default();
    meta.embedding_provider = Some("local".to_string());
    meta.embedding_dimensions = Some(768);
    store.set_document_complete(&doc.id, &meta).await.unwrap();

    let done = store.get_document(&doc.id).await.unwrap();
    assert_eq!(done.status, DocumentStatus::Complete);
    assert!(done.processed_at.is_some());
    assert_eq!(done.metadata.embedding_provider.as_deref(), Some("local"));

    // Error path requires a message.
    store.set_document_error(&doc.id, "provider exploded").await.unwrap();
    let failed = store.get_document(&doc.id).await.unwrap();
    assert_eq!(failed.status, DocumentStatus::Error);
    assert_eq!(failed.error_message.as_deref(), Some("provider exploded"));
}
