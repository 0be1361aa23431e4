//! Query engine helpers shared across backends
//!
//! Ranking and similarity filtering live here so every backend produces
//! the same deterministic ordering; the natural-language time grammar is
//! in [`time`].

pub mod time;

pub use time::parse_time_query;

use std::cmp::Ordering;

use crate::types::MemoryQueryResult;

/// Candidate pool floor for nearest-neighbor retrieval: fetch
/// `max(n, MIN_CANDIDATE_POOL)` before ranking and truncating.
pub const MIN_CANDIDATE_POOL: usize = 50;

/// Sort results into the canonical order: similarity descending, then
/// `created_at` descending, then `content_hash` ascending.
pub fn rank_results(results: &mut [MemoryQueryResult]) {
    results.sort_by(compare_results);
}

fn compare_results(a: &MemoryQueryResult, b: &MemoryQueryResult) -> Ordering {
    b.similarity_score
        .partial_cmp(&a.similarity_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.memory
                .created_at
                .partial_cmp(&a.memory.created_at)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.memory.content_hash.cmp(&b.memory.content_hash))
}

/// Drop results below the similarity floor. Applied after retrieval; a
/// shorter list is returned when fewer than `n` survive.
pub fn apply_min_similarity(
    results: Vec<MemoryQueryResult>,
    min_similarity: f32,
) -> Vec<MemoryQueryResult> {
    if min_similarity <= 0.0 {
        return results;
    }
    results
        .into_iter()
        .filter(|r| r.similarity_score >= min_similarity)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Memory;
    use std::collections::HashMap;

    fn result(content: &str, score: f32, created_at: f64) -> MemoryQueryResult {
        let mut memory = Memory::new(content, vec![], None, HashMap::new()).unwrap();
        memory.created_at = created_at;
        memory.sync_iso_timestamps();
        MemoryQueryResult {
            memory,
            similarity_score: score,
            relevance_reason: format!("vector:{score:.4}"),
        }
    }

    #[test]
    fn ranking_order() {
        let mut results = vec![
            result("a", 0.5, 100.0),
            result("b", 0.9, 50.0),
            result("c", 0.5, 200.0),
        ];
        rank_results(&mut results);
        assert_eq!(results[0].memory.content, "b");
        // Same score: newer first
        assert_eq!(results[1].memory.content, "c");
        assert_eq!(results[2].memory.content, "a");
    }

    #[test]
    fn hash_breaks_full_ties() {
        let mut results = vec![result("zz", 0.5, 100.0), result("aa", 0.5, 100.0)];
        rank_results(&mut results);
        let hashes: Vec<_> = results.iter().map(|r| r.memory.content_hash.clone()).collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);
    }

    #[test]
    fn min_similarity_filter() {
        let results = vec![result("a", 0.9, 1.0), result("b", 0.3, 1.0)];
        let filtered = apply_min_similarity(results, 0.5);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].memory.content, "a");
    }

    #[test]
    fn zero_min_similarity_keeps_all() {
        let results = vec![result("a", 0.0, 1.0), result("b", 0.1, 1.0)];
        assert_eq!(apply_min_similarity(results, 0.0).len(), 2);
    }
}
