//! Cache Entry Types
//!
//! Every derived entry carries the rule-set version and the provider epoch it
//! was computed under, so a read can reject it once the provider has been
//! invalidated even if explicit eviction has not reached it yet.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::domain::{Direction, ProviderId, RuleVersion};
use crate::mapping::SymbolOutcome;

/// Entry wrapper stored in every layer
#[derive(Debug, Clone)]
pub struct CachedEntry<V> {
    value: V,
    version: RuleVersion,
    epoch: u64,
    inserted_at: Instant,
    expires_at: Instant,
}

impl<V> CachedEntry<V> {
    /// Create an entry that expires `ttl` from now
    pub fn new(value: V, version: RuleVersion, epoch: u64, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            version,
            epoch,
            inserted_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn version(&self) -> RuleVersion {
        self.version
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }

    /// Time left before expiry (zero once expired)
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// L2 key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolKey {
    pub provider: ProviderId,
    pub direction: Direction,
    pub symbol: String,
}

impl SymbolKey {
    pub fn new(provider: ProviderId, direction: Direction, symbol: impl Into<String>) -> Self {
        Self {
            provider,
            direction,
            symbol: symbol.into(),
        }
    }
}

/// One resolved translation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMapping {
    pub provider: ProviderId,
    pub direction: Direction,
    pub source: String,
    pub target: String,
    /// Rule-set version the mapping was derived from
    pub version: RuleVersion,
    /// Market of the rule that produced it
    pub market: String,
}

impl SymbolMapping {
    pub fn key(&self) -> SymbolKey {
        SymbolKey::new(self.provider.clone(), self.direction, self.source.clone())
    }
}

/// Outcome of resolving one symbol set for one (provider, direction) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub provider: ProviderId,
    pub direction: Direction,
    /// Sorted, de-duplicated input symbols
    pub symbols: Vec<String>,
    pub outcomes: BTreeMap<String, SymbolOutcome>,
    pub success_count: usize,
    pub failure_count: usize,
    /// Rule-set versions that contributed to the outcomes
    pub rule_versions: BTreeSet<RuleVersion>,
}

impl BatchResult {
    pub fn new(
        provider: ProviderId,
        direction: Direction,
        outcomes: BTreeMap<String, SymbolOutcome>,
        rule_versions: BTreeSet<RuleVersion>,
    ) -> Self {
        let success_count = outcomes.values().filter(|o| o.is_mapped()).count();
        let failure_count = outcomes.len() - success_count;
        Self {
            provider,
            direction,
            symbols: outcomes.keys().cloned().collect(),
            outcomes,
            success_count,
            failure_count,
            rule_versions,
        }
    }

    /// Newest contributing version, used as the L3 entry tag
    pub fn newest_version(&self) -> Option<RuleVersion> {
        self.rule_versions.iter().next_back().copied()
    }

    /// A batch is only cached when none of its outcomes is transient
    pub fn is_cacheable(&self) -> bool {
        self.outcomes.values().all(SymbolOutcome::is_cacheable)
    }

    pub fn is_success(&self) -> bool {
        self.failure_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingFailure;

    #[test]
    fn test_entry_expiry() {
        let entry = CachedEntry::new("v", RuleVersion(1), 0, Duration::from_secs(60));
        assert!(!entry.is_expired());
        assert!(entry.remaining_ttl() > Duration::from_secs(59));
        assert!(entry.is_expired_at(Instant::now() + Duration::from_secs(61)));

        let expired = CachedEntry::new("v", RuleVersion(1), 0, Duration::ZERO);
        assert!(expired.is_expired());
        assert_eq!(expired.remaining_ttl(), Duration::ZERO);
    }

    #[test]
    fn test_batch_result_counts() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert("AAA".to_string(), SymbolOutcome::mapped("AAA.US"));
        outcomes.insert(
            "ZZZ".to_string(),
            SymbolOutcome::failed(MappingFailure::NoMatchingRule),
        );
        let result = BatchResult::new(
            ProviderId::from("acme"),
            Direction::ToStandard,
            outcomes,
            [RuleVersion(3), RuleVersion(4)].into_iter().collect(),
        );

        assert_eq!(result.success_count, 1);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.symbols, vec!["AAA", "ZZZ"]);
        assert_eq!(result.newest_version(), Some(RuleVersion(4)));
        assert!(result.is_cacheable());
        assert!(!result.is_success());
    }

    #[test]
    fn test_batch_with_transient_failure_is_not_cacheable() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            "AAA".to_string(),
            SymbolOutcome::failed(MappingFailure::QueryTimeout),
        );
        let result = BatchResult::new(
            ProviderId::from("acme"),
            Direction::ToStandard,
            outcomes,
            BTreeSet::new(),
        );
        assert!(!result.is_cacheable());
        assert_eq!(result.newest_version(), None);
    }
}
