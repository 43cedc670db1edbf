//! Property-Based Tests for the Memory Cache Backend
//!
//! **Property: bounded insertion-order eviction**
//!
//! For any sequence of sets whose entries each fit the budget on their own,
//! the entries still present form a suffix of the insertion order, the newest
//! entry is always present, and the accounted bytes never exceed the budget.
//!
//! **Property: lookup accounting**
//!
//! Every `get` bumps exactly one of the hit or miss counters; `exists` bumps
//! neither.

use cairn_cache::{estimate_size, MemoryCacheBackend};
use cairn_test_utils::generators::{arb_clean_component, arb_distinct_entries, arb_json_value};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

fn backend(max_bytes: usize) -> MemoryCacheBackend {
    MemoryCacheBackend::new(max_bytes, Duration::from_secs(60))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Largest generated entry is well under 200 bytes, so nothing is rejected.
    #[test]
    fn prop_eviction_keeps_insertion_suffix(
        max_bytes in 200usize..4000,
        entries in arb_distinct_entries(60),
    ) {
        let cache = backend(max_bytes);
        for (key, value) in &entries {
            cache.set(key, value.clone(), None).unwrap();
        }

        let present: Vec<bool> = entries
            .iter()
            .map(|(key, _)| cache.exists(key).unwrap())
            .collect();

        // Once an entry is present, every later one is too.
        let first_present = present.iter().position(|p| *p);
        prop_assert!(first_present.is_some());
        let first_present = first_present.unwrap();
        prop_assert!(present[first_present..].iter().all(|p| *p));
        prop_assert!(*present.last().unwrap());

        let expected_bytes: usize = entries[first_present..]
            .iter()
            .map(|(key, value)| estimate_size(key, value).unwrap())
            .sum();

        let stats = cache.stats().unwrap();
        prop_assert_eq!(stats.memory_bytes as usize, expected_bytes);
        prop_assert!(stats.memory_bytes as usize <= max_bytes);
        prop_assert_eq!(stats.entry_count as usize, entries.len() - first_present);
        prop_assert_eq!(stats.rejections, 0);
    }

    #[test]
    fn prop_every_get_counts_once(
        stored in prop::collection::btree_set(arb_clean_component(), 0..20),
        lookups in prop::collection::vec(arb_clean_component(), 1..40),
    ) {
        let cache = backend(1024 * 1024);
        for key in &stored {
            cache.set(key, serde_json::json!(key), None).unwrap();
        }

        for key in &lookups {
            cache.exists(key).unwrap();
        }
        let before = cache.stats().unwrap();
        prop_assert_eq!(before.hits + before.misses, 0);

        let mut expected_hits = 0u64;
        for key in &lookups {
            let got = cache.get(key).unwrap();
            prop_assert_eq!(got.is_some(), stored.contains(key));
            if stored.contains(key) {
                expected_hits += 1;
            }
        }

        let after = cache.stats().unwrap();
        prop_assert_eq!(after.hits, expected_hits);
        prop_assert_eq!(after.misses, lookups.len() as u64 - expected_hits);
    }

    #[test]
    fn prop_set_then_get_before_ttl(
        key in arb_clean_component(),
        value in arb_json_value(),
    ) {
        let cache = backend(1024 * 1024);
        cache.set(&key, value.clone(), Some(Duration::from_secs(3600))).unwrap();
        prop_assert_eq!(cache.get(&key).unwrap(), Some(value));
    }

    #[test]
    fn prop_namespace_invalidation_is_exact(
        users in prop::collection::btree_set(arb_clean_component(), 0..15),
        others in prop::collection::btree_set(arb_clean_component(), 0..15),
    ) {
        let cache = backend(1024 * 1024);
        for id in &users {
            cache.set(&format!("user:{}", id), serde_json::json!(1), None).unwrap();
        }
        for id in &others {
            cache.set(&format!("users:{}", id), serde_json::json!(2), None).unwrap();
            cache.set(&format!("team:user:{}", id), serde_json::json!(3), None).unwrap();
        }

        let removed = cache.invalidate_pattern("user:*").unwrap();
        prop_assert_eq!(removed as usize, users.len());

        let survivors: BTreeSet<String> = others
            .iter()
            .flat_map(|id| [format!("users:{}", id), format!("team:user:{}", id)])
            .collect();
        for key in &survivors {
            prop_assert!(cache.exists(key).unwrap());
        }
        prop_assert_eq!(cache.stats().unwrap().entry_count as usize, survivors.len());
    }
}
