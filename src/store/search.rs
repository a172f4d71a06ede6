//! The ranking core of the similarity search engine.
//!
//! Candidate generation (exact scan or ANN) only decides which chunks are
//! considered; the functions here decide everything the contract promises:
//! scores, filtering, threshold, ordering, truncation.

use itertools::Itertools;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

use super::metadata;
use crate::database::sqlite::Chunk;

pub const DEFAULT_MATCH_COUNT: usize = 10;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;

/// Parameters of one similarity query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub embedding: Vec<f32>,
    pub match_count: usize,
    /// Metadata containment filter; the empty object matches everything.
    pub filter: Value,
    /// Results must score strictly above this value.
    pub similarity_threshold: f32,
}

impl SearchParams {
    #[inline]
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            match_count: DEFAULT_MATCH_COUNT,
            filter: Value::Object(serde_json::Map::new()),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// One ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub similarity_score: f32,
}

/// `1 - cosine_distance(a, b)`, i.e. the raw cosine of the angle between
/// the vectors. Deliberately unclamped: embeddings are stored as given, so
/// non-unit vectors can produce scores outside `[0, 1]` and callers must
/// tolerate that. A zero-norm vector has no defined angle and yields NaN,
/// which never passes the threshold.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Apply the authoritative search semantics to a candidate superset:
/// metadata containment, strict score threshold, score-descending order
/// with ascending-id tie-break, truncation to the match count.
pub(crate) fn rank(candidates: Vec<Chunk>, params: &SearchParams) -> Vec<SearchResult> {
    candidates
        .into_iter()
        .filter(|chunk| metadata::contains(&chunk.metadata, &params.filter))
        .map(|chunk| {
            let similarity_score = cosine_similarity(&chunk.embedding, &params.embedding);
            SearchResult {
                chunk,
                similarity_score,
            }
        })
        .filter(|result| result.similarity_score > params.similarity_threshold)
        .sorted_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        })
        .take(params.match_count)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn chunk(id: i64, embedding: Vec<f32>, metadata: Value) -> Chunk {
        Chunk {
            id,
            url: format!("https://example.com/{id}"),
            chunk_number: 0,
            title: "t".to_string(),
            summary: "s".to_string(),
            content: "c".to_string(),
            metadata,
            embedding,
            created_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn identical_vectors_score_exactly_one() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn opposite_vectors_score_below_zero() {
        // Unclamped formula: scores leave [0, 1] for non-aligned vectors.
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), -1.0);
    }

    #[test]
    fn zero_norm_vector_scores_nan() {
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_nan());
    }

    #[test]
    fn results_sorted_by_score_then_id() {
        let candidates = vec![
            chunk(3, vec![1.0, 0.0], json!({})),
            chunk(1, vec![0.6, 0.8], json!({})),
            chunk(2, vec![1.0, 0.0], json!({})),
        ];
        let params = SearchParams {
            similarity_threshold: 0.0,
            ..SearchParams::new(vec![1.0, 0.0])
        };

        let results = rank(candidates, &params);
        let ids: Vec<i64> = results.iter().map(|r| r.chunk.id).collect();
        // Equal top scores fall back to ascending insertion id.
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn threshold_is_strictly_greater_than() {
        let candidates = vec![
            chunk(1, vec![1.0, 0.0], json!({})),
            chunk(2, vec![0.0, 1.0], json!({})),
        ];
        // The orthogonal chunk scores exactly 0.0 and must be excluded.
        let params = SearchParams {
            similarity_threshold: 0.0,
            ..SearchParams::new(vec![1.0, 0.0])
        };

        let results = rank(candidates, &params);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, 1);
    }

    #[test]
    fn zero_norm_chunks_never_match() {
        let candidates = vec![chunk(1, vec![0.0, 0.0], json!({}))];
        let params = SearchParams {
            similarity_threshold: f32::NEG_INFINITY,
            ..SearchParams::new(vec![1.0, 0.0])
        };

        assert!(rank(candidates, &params).is_empty());
    }

    #[test]
    fn filter_discards_non_containing_metadata() {
        let candidates = vec![
            chunk(1, vec![1.0, 0.0], json!({"source": "docs", "lang": "en"})),
            chunk(2, vec![1.0, 0.0], json!({"source": "blog"})),
        ];
        let params = SearchParams {
            similarity_threshold: 0.0,
            filter: json!({"source": "docs"}),
            ..SearchParams::new(vec![1.0, 0.0])
        };

        let results = rank(candidates, &params);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, 1);
    }

    #[test]
    fn match_count_truncates() {
        let candidates = (1..=5)
            .map(|id| chunk(id, vec![1.0, 0.0], json!({})))
            .collect();
        let params = SearchParams {
            match_count: 3,
            similarity_threshold: 0.0,
            ..SearchParams::new(vec![1.0, 0.0])
        };

        let results = rank(candidates, &params);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].chunk.id, 1);
    }

    #[test]
    fn empty_candidates_yield_empty_results() {
        let params = SearchParams::new(vec![1.0, 0.0]);
        assert!(rank(Vec::new(), &params).is_empty());
    }
}
