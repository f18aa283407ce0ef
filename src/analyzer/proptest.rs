//! Property-Based Tests for the TTL rule table
//!
//! # Test Properties
//!
//! 1. **Bounded TTL**: a suggestion lies within `[1s, max_ttl]`
//! 2. **Priority**: a low hit rate always wins, regardless of other inputs
//! 3. **Bounded proxies**: access frequency and utilization stay in `[0, 1]`

#![cfg(test)]

use std::time::Duration;

use proptest::prelude::*;

use super::stats::{access_frequency, evaluate_rules, ttl_utilization, AnalyzerThresholds, UsageStats};
use crate::cache::DataType;

// =============================================================================
// Property Strategies
// =============================================================================

fn rate_strategy() -> impl Strategy<Value = f64> {
    0.0f64..=1.0
}

fn stats_strategy() -> impl Strategy<Value = UsageStats> {
    (1usize..200, rate_strategy(), rate_strategy(), rate_strategy(), 0.0f64..86400.0).prop_map(
        |(sampled_keys, hit_rate, eviction_rate, ttl_utilization, idle)| UsageStats {
            data_type: DataType::Statistics,
            sampled_keys,
            hit_rate,
            miss_rate: 1.0 - hit_rate,
            eviction_rate,
            average_access_time: idle,
            access_frequency: access_frequency(Duration::from_secs_f64(idle)),
            ttl_utilization,
        },
    )
}

// =============================================================================
// Rule Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: suggested TTLs are whole seconds within `[1s, max_ttl]`.
    #[test]
    fn prop_suggestion_bounded(
        stats in stats_strategy(),
        ttl_secs in 1u64..u64::MAX,
        max_secs in 1u64..10_000_000,
    ) {
        let thresholds = AnalyzerThresholds::default();
        let max_ttl = Duration::from_secs(max_secs);
        if let Some(outcome) = evaluate_rules(&stats, Duration::from_secs(ttl_secs), &thresholds, max_ttl) {
            prop_assert!(outcome.suggested_ttl >= Duration::from_secs(1));
            prop_assert!(outcome.suggested_ttl <= max_ttl);
            prop_assert_eq!(outcome.suggested_ttl.subsec_nanos(), 0);
            prop_assert!((0.0..=1.0).contains(&outcome.confidence));
        }
    }

    /// Property: a hit rate under the threshold always selects the first rule.
    #[test]
    fn prop_low_hit_rate_wins(stats in stats_strategy(), ttl_secs in 1u64..1_000_000) {
        let thresholds = AnalyzerThresholds::default();
        let outcome = evaluate_rules(&stats, Duration::from_secs(ttl_secs), &thresholds, Duration::from_secs(u32::MAX as u64));
        if stats.hit_rate < thresholds.min_hit_rate {
            let outcome = outcome.expect("rule must fire");
            prop_assert_eq!(outcome.reason, "low hit rate");
            prop_assert_eq!(outcome.confidence, 0.8);
        } else if let Some(outcome) = outcome {
            prop_assert_ne!(outcome.reason, "low hit rate");
        }
    }

    /// Property: empty stats never produce a recommendation.
    #[test]
    fn prop_empty_stats_silent(ttl_secs in 1u64..1_000_000) {
        let stats = UsageStats::empty(DataType::UserSessions);
        let max_ttl = Duration::from_secs(u32::MAX as u64);
        prop_assert!(evaluate_rules(&stats, Duration::from_secs(ttl_secs), &AnalyzerThresholds::default(), max_ttl).is_none());
    }

    /// Property: heuristic proxies stay within the unit interval.
    #[test]
    fn prop_proxies_bounded(idle in 0u64..10_000_000, policy in 0u64..1_000_000, remaining in 0u64..2_000_000) {
        let freq = access_frequency(Duration::from_secs(idle));
        prop_assert!(freq > 0.0 && freq <= 1.0);

        let util = ttl_utilization(Duration::from_secs(policy), Duration::from_secs(remaining));
        prop_assert!((0.0..=1.0).contains(&util));
    }
}
