//! Property-based tests for claudefs-dm using proptest.
//!
//! These cover the invariants every batch operation and source ranking
//! relies on, over arbitrary inputs.

use claudefs_dm::batch::merge_sources;
use claudefs_dm::checksum::{checksum_bytes, checksums_match};
use claudefs_dm::directory::glob_to_regex;
use claudefs_dm::proximity::rank_sources;
use claudefs_dm::{BatchResult, DmError};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;

/// A batch step: which key, and whether it succeeds.
fn any_steps() -> impl Strategy<Value = Vec<(u8, bool)>> {
    proptest::collection::vec((0u8..16, any::<bool>()), 0..64)
}

fn backend_names() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::btree_set("[A-H]", 0..8).prop_map(|s| s.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_batch_keys_partition(steps in any_steps()) {
        let mut result: BatchResult<u8, ()> = BatchResult::new();
        for (key, ok) in &steps {
            if *ok {
                result.succeed(*key, ());
            } else {
                result.append_failure(*key, "failed");
            }
        }
        let inputs: BTreeSet<u8> = steps.iter().map(|(k, _)| *k).collect();
        prop_assert!(result.partitions(inputs.iter()));
        // the last step decides each key
        for key in &inputs {
            let last = steps.iter().rev().find(|(k, _)| k == key).map(|(_, ok)| *ok);
            prop_assert_eq!(result.is_successful(key), last == Some(true));
        }
    }

    #[test]
    fn prop_absorb_keeps_partition(a in any_steps(), b in any_steps()) {
        let build = |steps: &[(u8, bool)]| {
            let mut r: BatchResult<u8, ()> = BatchResult::new();
            for (key, ok) in steps {
                if *ok { r.succeed(*key, ()) } else { r.fail(*key, "no") }
            }
            r
        };
        let mut merged = build(&a);
        merged.absorb(build(&b));
        let inputs: BTreeSet<u8> = a.iter().chain(b.iter()).map(|(k, _)| *k).collect();
        prop_assert!(merged.partitions(inputs.iter()));
    }

    #[test]
    fn prop_rank_is_tiered_permutation(
        candidates in backend_names(),
        local in backend_names(),
        country in backend_names(),
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let ranked = rank_sources(&candidates, &local, &country, &mut rng);

        let mut sorted = ranked.clone();
        sorted.sort();
        let mut expected = candidates.clone();
        expected.sort();
        prop_assert_eq!(sorted, expected);

        let tier = |b: &String| {
            if local.contains(b) { 0 } else if country.contains(b) { 1 } else { 2 }
        };
        let tiers: Vec<u8> = ranked.iter().map(tier).collect();
        prop_assert!(tiers.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn prop_merge_sources_joins_both_failures(a in "[a-z ]{1,20}", b in "[a-z ]{1,20}") {
        let merged: Result<u8, DmError> = merge_sources(
            Err(DmError::Message(a.clone())),
            Err(DmError::Message(b.clone())),
            |x, _| x,
        );
        prop_assert_eq!(merged.unwrap_err().to_string(), format!("{}\n{}", a, b));
    }

    #[test]
    fn prop_checksum_comparison_ignores_padding(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let sum = checksum_bytes(&data);
        let stripped = sum.trim_start_matches('0').to_string();
        prop_assert!(checksums_match(&sum, &stripped));
        prop_assert!(checksums_match(&sum.to_uppercase(), &sum));
    }

    #[test]
    fn prop_star_matches_any_name(name in "/[a-z0-9/._-]{0,40}") {
        prop_assert!(glob_to_regex("*").unwrap().is_match(&name));
        let re = glob_to_regex(&name).unwrap();
        prop_assert!(re.is_match(&name));
    }
}
