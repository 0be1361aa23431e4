//! Property-based tests for mnemo
//!
//! These tests verify invariants that must hold for all inputs:
//! - Identity depends on content alone
//! - Normalization is idempotent
//! - Parsers never panic
//! - Ranking order is deterministic
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// CONTENT IDENTITY
// ============================================================================

mod identity_tests {
    use super::*;
    use mnemo::identity::content_hash;

    proptest! {
        /// Invariant: the hash is 64 lowercase hex characters for any input
        #[test]
        fn hash_shape(content in "\\PC*") {
            let hash = content_hash(&content);
            prop_assert_eq!(hash.len(), 64);
            prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }

        /// Invariant: hashing is deterministic
        #[test]
        fn hash_deterministic(content in "\\PC*") {
            prop_assert_eq!(content_hash(&content), content_hash(&content));
        }

        /// Invariant: identity is independent of metadata — two memories
        /// with the same content and different metadata share a hash
        #[test]
        fn hash_ignores_metadata(
            content in "\\PC{1,200}",
            key in "[a-z]{1,10}",
            value in "\\PC{0,50}",
        ) {
            prop_assume!(!content.trim().is_empty());
            let bare = mnemo::types::Memory::new(
                content.clone(), vec![], None, Default::default(),
            ).unwrap();

            let mut metadata = std::collections::HashMap::new();
            metadata.insert(key, serde_json::json!(value));
            let annotated = mnemo::types::Memory::new(
                content, vec![], None, metadata,
            ).unwrap();

            prop_assert_eq!(bare.content_hash, annotated.content_hash);
        }
    }
}

// ============================================================================
// TAG NORMALIZATION
// ============================================================================

mod tag_tests {
    use super::*;
    use mnemo::types::{normalize_tag, normalize_tags};

    proptest! {
        /// Invariant: normalize_tag never panics
        #[test]
        fn never_panics(tag in "\\PC*") {
            let _ = normalize_tag(&tag);
        }

        /// Invariant: normalization is idempotent
        #[test]
        fn idempotent(tag in "\\PC{1,80}") {
            if let Ok(once) = normalize_tag(&tag) {
                prop_assert_eq!(Ok(once.clone()), normalize_tag(&once));
            }
        }

        /// Invariant: output has no boundary whitespace and no runs
        #[test]
        fn whitespace_collapsed(tag in "\\PC{1,80}") {
            if let Ok(normalized) = normalize_tag(&tag) {
                prop_assert_eq!(normalized.trim(), normalized.as_str());
                prop_assert!(!normalized.contains("  "));
                prop_assert!(!normalized.is_empty());
            }
        }

        /// Invariant: a normalized list has no duplicates
        #[test]
        fn no_duplicates(tags in proptest::collection::vec("[a-zA-Z ]{1,20}", 0..10)) {
            if let Ok(normalized) = normalize_tags(tags) {
                let unique: std::collections::HashSet<_> = normalized.iter().collect();
                prop_assert_eq!(unique.len(), normalized.len());
            }
        }
    }
}

// ============================================================================
// TIME PARSER
// ============================================================================

mod time_parser_tests {
    use super::*;
    use mnemo::query::parse_time_query;

    proptest! {
        /// Invariant: the parser never panics, whatever the input
        #[test]
        fn never_panics(input in "\\PC*") {
            let _ = parse_time_query(&input);
        }

        /// Invariant: a parsed range is never inverted
        #[test]
        fn ranges_are_ordered(days in 0i64..4000) {
            let input = format!("{days} days ago");
            if let Ok(range) = parse_time_query(&input) {
                prop_assert!(range.start <= range.end);
            }
        }

        /// Invariant: valid dates parse to a full day
        #[test]
        fn dates_span_a_day(year in 1990i32..2090, month in 1u32..13, day in 1u32..29) {
            let input = format!("{year:04}-{month:02}-{day:02}");
            let range = parse_time_query(&input).unwrap();
            let width = range.end - range.start;
            prop_assert!((width - 86_399.0).abs() < 2.0 * 3600.0 + 1.0, "width {width}");
        }
    }
}

// ============================================================================
// RANKING
// ============================================================================

mod ranking_tests {
    use super::*;
    use mnemo::query::rank_results;
    use mnemo::types::{Memory, MemoryQueryResult};

    fn result(content: String, score: f32, created_at: f64) -> MemoryQueryResult {
        let mut memory = Memory::new(content, vec![], None, Default::default()).unwrap();
        memory.created_at = created_at;
        MemoryQueryResult {
            memory,
            similarity_score: score,
            relevance_reason: String::new(),
        }
    }

    proptest! {
        /// Invariant: after ranking, scores are non-increasing and ties
        /// fall back to created_at desc then content_hash asc
        #[test]
        fn order_is_deterministic(
            entries in proptest::collection::vec(
                ("[a-z]{1,12}", 0.0f32..=1.0, 0.0f64..1e9),
                1..20,
            )
        ) {
            let mut results: Vec<MemoryQueryResult> = entries
                .into_iter()
                .map(|(content, score, at)| result(content, score, at))
                .collect();
            rank_results(&mut results);

            for pair in results.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.similarity_score >= b.similarity_score);
                if a.similarity_score == b.similarity_score {
                    prop_assert!(a.memory.created_at >= b.memory.created_at);
                    if a.memory.created_at == b.memory.created_at {
                        prop_assert!(a.memory.content_hash <= b.memory.content_hash);
                    }
                }
            }
        }
    }
}

// ============================================================================
// FORMATTING
// ============================================================================

mod formatting_tests {
    use super::*;
    use mnemo::types::human_bytes;

    proptest! {
        /// Invariant: human_bytes never panics and always names a unit
        #[test]
        fn always_formats(bytes in 0u64..u64::MAX) {
            let formatted = human_bytes(bytes);
            prop_assert!(formatted.ends_with('B'));
            prop_assert!(formatted.contains(' '));
        }
    }

    #[test]
    fn timestamp_iso_round_trip_sample() {
        for ts in [0.0, 1.5, 1_700_000_000.123456, 4_000_000_000.0] {
            let iso = mnemo::identity::timestamp_to_iso(ts);
            let back = mnemo::identity::iso_to_timestamp(&iso).unwrap();
            assert!((back - ts).abs() < 1e-5, "{ts} -> {iso} -> {back}");
        }
    }
}
