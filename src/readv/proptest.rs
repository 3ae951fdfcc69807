//! Property-Based Tests for Extent Coalescing
//!
//! # Test Properties
//!
//! 1. **Exact partition**: concatenating the groups yields the input
//! 2. **Bounded groups**: fixed-count groups never exceed the limit
//! 3. **Greedy fill**: every fixed-count group but the last is full
//! 4. **Span bound**: multi-extent density groups stay under `max_span`
//! 5. **Determinism**: same input, same groups

#![cfg(test)]

use proptest::prelude::*;

use super::coalesce::ExtentCoalescer;
use super::extent::{Extent, ExtentHolder};
use crate::config::CoalescePolicy;

// =============================================================================
// Property Strategies
// =============================================================================

fn extent_strategy() -> impl Strategy<Value = Extent> {
    (0u64..1 << 30, 0u64..1 << 20).prop_map(|(begin, len)| Extent::new(begin, len))
}

fn holder_strategy() -> impl Strategy<Value = ExtentHolder> {
    prop::collection::vec(extent_strategy(), 0..200).prop_map(|v| v.into_iter().collect())
}

fn density_policy_strategy() -> impl Strategy<Value = CoalescePolicy> {
    (0u64..1 << 20, 1u64..1 << 26, 0.0f64..=1.0).prop_map(|(min_span, max_span, min_density)| {
        CoalescePolicy::Density {
            min_span: min_span.min(max_span),
            max_span,
            min_density,
        }
    })
}

fn flatten(groups: &[ExtentHolder]) -> Vec<Extent> {
    groups
        .iter()
        .flat_map(|g| g.extents().iter().copied())
        .collect()
}

// =============================================================================
// Fixed-count Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_fixed_count_partitions_input(input in holder_strategy(), max in 0usize..32) {
        let coalescer = ExtentCoalescer::new(CoalescePolicy::FixedCount { max_extents: max });
        let groups = coalescer.convert(&input);
        prop_assert_eq!(flatten(&groups), input.extents().to_vec());
    }

    #[test]
    fn prop_fixed_count_group_sizes(input in holder_strategy(), max in 1usize..32) {
        let coalescer = ExtentCoalescer::new(CoalescePolicy::FixedCount { max_extents: max });
        let groups = coalescer.convert(&input);

        prop_assert!(groups.iter().all(|g| !g.is_empty() && g.count() <= max));
        if let Some((_, full)) = groups.split_last() {
            prop_assert!(full.iter().all(|g| g.count() == max));
        }
        prop_assert_eq!(groups.len(), input.count().div_ceil(max));
    }
}

// =============================================================================
// Density Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_density_partitions_input(
        input in holder_strategy(),
        policy in density_policy_strategy(),
    ) {
        let groups = ExtentCoalescer::new(policy).convert(&input);
        prop_assert!(groups.iter().all(|g| !g.is_empty()));
        prop_assert_eq!(flatten(&groups), input.extents().to_vec());
    }

    #[test]
    fn prop_density_respects_max_span(
        input in holder_strategy(),
        policy in density_policy_strategy(),
    ) {
        let CoalescePolicy::Density { min_span, max_span, .. } = policy else {
            unreachable!();
        };
        for group in ExtentCoalescer::new(policy).convert(&input) {
            if group.count() > 1 {
                prop_assert!(group.span() < max_span.max(min_span));
            }
        }
    }

    #[test]
    fn prop_convert_is_deterministic(
        input in holder_strategy(),
        policy in density_policy_strategy(),
    ) {
        let coalescer = ExtentCoalescer::new(policy);
        prop_assert_eq!(coalescer.convert(&input), coalescer.convert(&input));
    }
}
