//! Trust and recency rescoring.
//!
//! Optional multiplicative rescoring of a ranked result list using
//! document metadata: `official` sources outrank `community` ones, and
//! recently verified material outranks stale material. Applied between
//! fusion and reranking when enabled.
//!
//! The adjusted similarity replaces the ranked score; the pre-rescore
//! value is preserved as `base_similarity`, and the applied weights are
//! attached per result for observability.

use chrono::{NaiveDate, Utc};

use crate::models::SearchResult;

/// Average days per month; used to turn a date delta into months.
const DAYS_PER_MONTH: f64 = 30.44;

/// Trust weight for a result, defaulting to 0.5 for unknown quality.
fn trust_weight(result: &SearchResult) -> f64 {
    result
        .metadata
        .source_quality
        .map(|q| q.trust_weight())
        .unwrap_or(0.5)
}

/// Recency weight from `last_verified`:
/// under 6 months 1.0, under 12 months 0.9, otherwise (or unknown) 0.7.
fn recency_weight(result: &SearchResult, today: NaiveDate) -> f64 {
    let Some(verified) = result
        .metadata
        .last_verified
        .as_deref()
        .and_then(parse_iso_date)
    else {
        return 0.7;
    };

    let months = months_between(today, verified);
    if months < 6.0 {
        1.0
    } else if months < 12.0 {
        0.9
    } else {
        0.7
    }
}

/// Parse an ISO date, tolerating a trailing time component.
pub fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    let date_part = s.split('T').next().unwrap_or(s);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Whole-and-fractional months between two dates (0 when `then` is in the
/// future).
pub fn months_between(today: NaiveDate, then: NaiveDate) -> f64 {
    let days = (today - then).num_days();
    if days <= 0 {
        0.0
    } else {
        days as f64 / DAYS_PER_MONTH
    }
}

/// Rescore and re-sort results by trust and recency.
pub fn rescore(results: &mut [SearchResult]) {
    rescore_at(results, Utc::now().date_naive());
}

/// Deterministic variant with an injected "today" for tests.
pub fn rescore_at(results: &mut [SearchResult], today: NaiveDate) {
    for result in results.iter_mut() {
        let trust = trust_weight(result);
        let recency = recency_weight(result, today);
        let factor = trust * recency;

        result.base_similarity = Some(result.similarity);
        result.similarity *= factor;
        if let Some(fused) = result.fused_score {
            result.fused_score = Some(fused * factor);
        }
        result.trust_weight = Some(trust);
        result.recency_weight = Some(recency);
    }

    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Citation, Metadata, SourceQuality};

    fn result(chunk_id: i64, similarity: f64, quality: Option<SourceQuality>, verified: Option<&str>) -> SearchResult {
        let mut metadata = Metadata::default();
        metadata.source_quality = quality;
        metadata.last_verified = verified.map(str::to_string);
        SearchResult {
            chunk_id,
            text: String::new(),
            similarity,
            document_id: "doc".to_string(),
            doc_title: "Doc".to_string(),
            source_url: None,
            metadata,
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

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()
    }

    #[test]
    fn recency_bands() {
        let fresh = result(1, 1.0, None, Some("2026-03-01")); // 3 months
        let aging = result(2, 1.0, None, Some("2025-09-01")); // 9 months
        let stale = result(3, 1.0, None, Some("2024-01-01")); // 29 months
        let unknown = result(4, 1.0, None, None);

        assert_eq!(recency_weight(&fresh, today()), 1.0);
        assert_eq!(recency_weight(&aging, today()), 0.9);
        assert_eq!(recency_weight(&stale, today()), 0.7);
        assert_eq!(recency_weight(&unknown, today()), 0.7);
    }

    #[test]
    fn unknown_quality_uses_half_weight() {
        let r = result(1, 1.0, None, None);
        assert_eq!(trust_weight(&r), 0.5);
    }

    #[test]
    fn rescoring_is_monotone_in_trust_times_recency() {
        // Identical base similarity; official+fresh must outrank
        // community+stale after rescoring.
        let mut results = vec![
            result(1, 0.8, Some(SourceQuality::Community), Some("2023-01-01")),
            result(2, 0.8, Some(SourceQuality::Official), Some("2026-05-01")),
        ];
        rescore_at(&mut results, today());

        assert_eq!(results[0].chunk_id, 2);
        assert!(results[0].similarity > results[1].similarity);

        // official * fresh = 1.0 * 1.0
        assert_eq!(results[0].similarity, 0.8);
        // community * stale = 0.6 * 0.7
        assert!((results[1].similarity - 0.8 * 0.42).abs() < 1e-9);
    }

    #[test]
    fn weights_and_base_similarity_attached() {
        let mut results = vec![result(1, 0.5, Some(SourceQuality::Verified), Some("2026-05-20"))];
        rescore_at(&mut results, today());

        assert_eq!(results[0].trust_weight, Some(0.85));
        assert_eq!(results[0].recency_weight, Some(1.0));
        assert_eq!(results[0].base_similarity, Some(0.5));
        assert!((results[0].similarity - 0.425).abs() < 1e-9);
    }

    #[test]
    fn fused_score_rescored_when_present() {
        let mut r = result(1, 0.5, Some(SourceQuality::Official), Some("2026-05-20"));
        r.fused_score = Some(0.02);
        let mut results = vec![r];
        rescore_at(&mut results, today());
        assert!((results[0].fused_score.unwrap() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn iso_datetime_accepted() {
        assert!(parse_iso_date("2026-01-15").is_some());
        assert!(parse_iso_date("2026-01-15T12:30:00Z").is_some());
        assert!(parse_iso_date("January 2026").is_none());
    }
}
