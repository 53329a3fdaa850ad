//! Hybrid retrieval scoring.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Keyword (sparse) and vector (dense) candidates arrive with raw scores
//!    on unrelated scales.
//! 2. Each list is min-max normalized to `[0, 1]` ([`normalize_scores`]).
//! 3. The union is blended: `hybrid = (1 - α) × keyword + α × vector`, where a
//!    candidate missing from one list contributes `0` for that side.
//! 4. Results are sorted by hybrid score descending, ties by candidate id.
//!
//! On top of that, retrieval for several query phrasings is merged with
//! [`fuse_by_max`], and the final list is arranged with
//! [`long_context_reorder`] before it is placed in the prompt.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::ScoredSegment;

/// A raw search hit from one side of the hybrid search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Position of the segment within its collection.
    pub id: usize,
    pub raw_score: f64,
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[Candidate]) -> Vec<(usize, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c.id, norm)
        })
        .collect()
}

/// Blend keyword and vector candidates into one ranked list.
pub fn fuse_hybrid(
    keyword: &[Candidate],
    vector: &[Candidate],
    alpha: f64,
    limit: usize,
) -> Vec<(usize, f64)> {
    let mut merged: HashMap<usize, (f64, f64)> = HashMap::new();
    for (id, score) in normalize_scores(keyword) {
        merged.entry(id).or_default().0 = score;
    }
    for (id, score) in normalize_scores(vector) {
        merged.entry(id).or_default().1 = score;
    }

    let mut results: Vec<(usize, f64)> = merged
        .into_iter()
        .map(|(id, (kw, vec))| (id, (1.0 - alpha) * kw + alpha * vec))
        .collect();
    results.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    results.truncate(limit);
    results
}

/// Merge per-query result lists, keeping each segment's best score.
///
/// Segments are identified by `(source_file, page, text)`. The output is
/// sorted by score descending; equal scores keep first-seen order.
pub fn fuse_by_max(lists: Vec<Vec<ScoredSegment>>, limit: usize) -> Vec<ScoredSegment> {
    let mut positions: HashMap<(Option<String>, Option<u32>, String), usize> = HashMap::new();
    let mut fused: Vec<ScoredSegment> = Vec::new();

    for hit in lists.into_iter().flatten() {
        let key = (
            hit.segment.source_file.clone(),
            hit.segment.page,
            hit.segment.text.clone(),
        );
        match positions.get(&key) {
            Some(&pos) => {
                let existing = &mut fused[pos];
                if hit.score.unwrap_or(0.0) > existing.score.unwrap_or(0.0) {
                    existing.score = hit.score;
                }
            }
            None => {
                positions.insert(key, fused.len());
                fused.push(hit);
            }
        }
    }

    // Stable sort keeps first-seen order among ties.
    fused.sort_by(|a, b| {
        b.score
            .unwrap_or(0.0)
            .partial_cmp(&a.score.unwrap_or(0.0))
            .unwrap_or(Ordering::Equal)
    });
    fused.truncate(limit);
    fused
}

/// Arrange rank-ordered items so the strongest sit at both ends.
///
/// Models attend best to the start and end of a long context. Given items
/// best-first, the best lands first, the runner-up last, and the weakest in
/// the middle.
pub fn long_context_reorder<T>(ranked: Vec<T>) -> Vec<T> {
    let mut front = Vec::with_capacity(ranked.len() / 2 + 1);
    let mut back = Vec::with_capacity(ranked.len() / 2);
    for (i, item) in ranked.into_iter().enumerate() {
        if i % 2 == 0 {
            front.push(item);
        } else {
            back.push(item);
        }
    }
    front.extend(back.into_iter().rev());
    front
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Segment;

    fn c(id: usize, raw_score: f64) -> Candidate {
        Candidate { id, raw_score }
    }

    fn hit(text: &str, score: f64) -> ScoredSegment {
        ScoredSegment {
            segment: Segment::new(text, "f.pdf", Some(1)),
            score: Some(score),
        }
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let result = normalize_scores(&[c(0, 5.0)]);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let result = normalize_scores(&[c(0, 10.0), c(1, 5.0), c(2, 0.0)]);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        for (_, score) in normalize_scores(&[c(0, 3.0), c(1, 3.0)]) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_hybrid_alpha_extremes() {
        let kw = vec![c(0, 10.0), c(1, 5.0), c(2, 1.0)];
        let vec = vec![c(2, 0.9), c(1, 0.5), c(0, 0.1)];

        let keyword_only = fuse_hybrid(&kw, &vec, 0.0, 10);
        assert_eq!(keyword_only[0].0, 0);

        let vector_only = fuse_hybrid(&kw, &vec, 1.0, 10);
        assert_eq!(vector_only[0].0, 2);
    }

    #[test]
    fn test_hybrid_missing_side_counts_zero() {
        let kw = vec![c(0, 2.0)];
        let vec = vec![c(1, 0.8), c(2, 0.4)];
        let fused = fuse_hybrid(&kw, &vec, 0.5, 10);
        assert_eq!(fused.len(), 3);
        for (_, score) in &fused {
            assert!((0.0..=1.0).contains(score));
        }
        // id 0: 0.5 * 1.0; id 1: 0.5 * 1.0; tie broken by id.
        assert_eq!(fused[0].0, 0);
        assert_eq!(fused[1].0, 1);
        assert!((fused[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_hybrid_limit() {
        let vec: Vec<_> = (0..10).map(|i| c(i, i as f64)).collect();
        assert_eq!(fuse_hybrid(&[], &vec, 0.5, 5).len(), 5);
    }

    #[test]
    fn test_fuse_by_max_keeps_best_score() {
        let fused = fuse_by_max(
            vec![
                vec![hit("a", 0.4), hit("b", 0.9)],
                vec![hit("a", 0.95), hit("c", 0.1)],
            ],
            5,
        );
        let texts: Vec<_> = fused.iter().map(|h| h.segment.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(fused[0].score, Some(0.95));
    }

    #[test]
    fn test_fuse_by_max_truncates() {
        let list: Vec<_> = (0..8).map(|i| hit(&i.to_string(), i as f64 / 10.0)).collect();
        assert_eq!(fuse_by_max(vec![list], 5).len(), 5);
    }

    #[test]
    fn test_reorder_best_at_edges() {
        assert_eq!(long_context_reorder(vec![1, 2, 3, 4, 5]), vec![1, 3, 5, 4, 2]);
        assert_eq!(long_context_reorder(vec![1, 2, 3, 4]), vec![1, 3, 4, 2]);
        assert_eq!(long_context_reorder(vec![1, 2]), vec![1, 2]);
        assert_eq!(long_context_reorder(vec![1]), vec![1]);
        assert!(long_context_reorder(Vec::<u8>::new()).is_empty());
    }
}
