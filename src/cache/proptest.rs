//! Property-Based Tests for the Cache Layers
//!
//! # Test Properties
//!
//! 1. **Digest Stability**: symbol order and duplicates never change a digest
//! 2. **TTL Bounds**: every computed TTL stays inside its layer's bounds, and
//!    L3 never outlives L2
//! 3. **Bounded Layers**: a layer never exceeds its capacity and its
//!    provider index always agrees with its contents
//! 4. **Reconnect Delay**: capped and non-decreasing in the attempt number

#![cfg(test)]

use std::time::Duration;

use proptest::prelude::*;

use super::bounded::BoundedLru;
use super::digest::BatchDigest;
use super::entry::CachedEntry;
use super::layers::CacheTier;
use super::policy::{DynamicTtlCalculator, LayerTtlBounds, TtlPolicy};
use crate::domain::{Direction, MarketSession, ProviderId, RuleVersion};
use crate::feed::reconnect_delay;

// =============================================================================
// Property Strategies
// =============================================================================

fn symbols_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Z]{1,5}(\\.[A-Z]{1,3})?", 1..24)
}

fn session_strategy() -> impl Strategy<Value = MarketSession> {
    prop_oneof![
        Just(MarketSession::Open),
        Just(MarketSession::Pre),
        Just(MarketSession::Post),
        Just(MarketSession::Closed),
    ]
}

/// Bounds with min <= base <= max, in seconds
fn bounds_strategy() -> impl Strategy<Value = LayerTtlBounds> {
    (1u64..1_000, 0u64..10_000, 0u64..10_000).prop_map(|(min, extra_base, extra_max)| {
        let base = min + extra_base;
        LayerTtlBounds::new(
            Duration::from_secs(base),
            Duration::from_secs(min),
            Duration::from_secs(base + extra_max),
        )
    })
}

fn policy_strategy() -> impl Strategy<Value = TtlPolicy> {
    (bounds_strategy(), bounds_strategy(), bounds_strategy(), 0.05f64..=1.0).prop_map(
        |(l1, l2, l3, open_factor)| TtlPolicy {
            l1,
            l2,
            l3,
            open_factor,
        },
    )
}

// =============================================================================
// Digest Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: shuffling and duplicating symbols yields the same digest.
    #[test]
    fn prop_digest_ignores_order_and_duplicates(
        (symbols, shuffled) in symbols_strategy()
            .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle())),
        dup_index in any::<prop::sample::Index>(),
    ) {
        let provider = ProviderId::from("acme");
        let mut duplicated = shuffled.clone();
        duplicated.push(symbols[dup_index.index(symbols.len())].clone());

        let original = BatchDigest::compute(&provider, Direction::ToStandard, &symbols);
        prop_assert_eq!(
            &original,
            &BatchDigest::compute(&provider, Direction::ToStandard, &shuffled)
        );
        prop_assert_eq!(
            &original,
            &BatchDigest::compute(&provider, Direction::ToStandard, &duplicated)
        );
    }

    /// Property: the direction is part of the digest.
    #[test]
    fn prop_digest_depends_on_direction(symbols in symbols_strategy()) {
        let provider = ProviderId::from("acme");
        prop_assert_ne!(
            BatchDigest::compute(&provider, Direction::ToStandard, &symbols),
            BatchDigest::compute(&provider, Direction::FromStandard, &symbols)
        );
    }

    /// Property: a computed digest always parses back to itself.
    #[test]
    fn prop_digest_parses(symbols in symbols_strategy()) {
        let digest = BatchDigest::compute(&ProviderId::from("acme"), Direction::ToStandard, &symbols);
        prop_assert_eq!(BatchDigest::parse(digest.as_str()).unwrap(), digest);
    }
}

// =============================================================================
// TTL Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Property: L1 and L2 TTLs stay within [min, max]; L3 stays within its
    /// own max and never exceeds L2.
    #[test]
    fn prop_ttl_within_bounds(policy in policy_strategy(), session in session_strategy()) {
        let calc = DynamicTtlCalculator::new(policy.clone());

        for tier in [CacheTier::L1, CacheTier::L2] {
            let bounds = policy.bounds(tier);
            let ttl = calc.compute_ttl(tier, session);
            prop_assert!(ttl >= bounds.min && ttl <= bounds.max);
        }

        let l3 = calc.compute_ttl(CacheTier::L3, session);
        prop_assert!(l3 <= policy.l3.max);
        prop_assert!(l3 <= calc.compute_ttl(CacheTier::L2, session));
    }

    /// Property: an open market never lengthens a TTL compared to a closed one.
    #[test]
    fn prop_open_never_longer_than_closed(policy in policy_strategy()) {
        let calc = DynamicTtlCalculator::new(policy);
        for tier in CacheTier::ALL {
            prop_assert!(
                calc.compute_ttl(tier, MarketSession::Open)
                    <= calc.compute_ttl(tier, MarketSession::Closed)
            );
        }
    }
}

// =============================================================================
// Bounded Layer Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: capacity is never exceeded and the provider index matches
    /// the stored entries, whatever mix of inserts and invalidations runs.
    #[test]
    fn prop_bounded_lru_index_consistent(
        capacity in 1usize..16,
        ops in prop::collection::vec((0u8..4, 0u32..32, any::<bool>()), 1..200),
    ) {
        let lru: BoundedLru<u32, u32> = BoundedLru::new(capacity);
        let providers: Vec<ProviderId> =
            (0..4).map(|i| ProviderId::from(format!("p{}", i))).collect();

        for (provider, key, invalidate) in ops {
            let provider = &providers[provider as usize];
            if invalidate {
                lru.invalidate_provider(provider);
            } else {
                let entry = CachedEntry::new(key, RuleVersion(1), 0, Duration::from_secs(60));
                lru.insert(provider.clone(), key, entry);
            }

            prop_assert!(lru.len() <= capacity);
            let indexed: usize = providers.iter().map(|p| lru.provider_len(p)).sum();
            prop_assert_eq!(indexed, lru.len());
        }
    }
}

// =============================================================================
// Reconnect Delay Properties
// =============================================================================

proptest! {
    /// Property: the delay is capped and grows monotonically with attempts.
    #[test]
    fn prop_reconnect_delay_capped_and_monotonic(
        base_ms in 1u64..5_000,
        extra_ms in 0u64..60_000,
        attempt in 0u32..64,
    ) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_millis(base_ms + extra_ms);

        let delay = reconnect_delay(base, max, attempt);
        prop_assert!(delay <= max);
        prop_assert!(delay >= base);
        prop_assert!(reconnect_delay(base, max, attempt + 1) >= delay);
    }
}
