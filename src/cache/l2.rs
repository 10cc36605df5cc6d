//! L2 Cache - Resolved Symbols
//!
//! One entry per (provider, direction, symbol). Only successful mappings are
//! stored here; a symbol with no matching rule is remembered by L3 instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bounded::{BoundedLru, LayerStatsSnapshot};
use super::coherence::Freshness;
use super::entry::{CachedEntry, SymbolKey, SymbolMapping};
use crate::domain::ProviderId;

/// L2 configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2Config {
    /// Maximum number of symbol mappings held
    pub max_entries: usize,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
        }
    }
}

/// L2 cache of individual symbol mappings
pub struct SymbolCache {
    store: BoundedLru<SymbolKey, SymbolMapping>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::with_config(L2Config::default())
    }

    pub fn with_config(config: L2Config) -> Self {
        Self {
            store: BoundedLru::new(config.max_entries),
        }
    }

    /// Mapping for `key` if it is live and still matches `freshness`
    pub fn get(&self, key: &SymbolKey, freshness: &Freshness) -> Option<SymbolMapping> {
        self.store
            .get_if(key, |entry| freshness.admits(entry))
            .map(CachedEntry::into_value)
    }

    /// Store mappings, each with its own lifetime, tagged with `epoch`
    pub fn put_many<I>(&self, epoch: u64, mappings: I)
    where
        I: IntoIterator<Item = (SymbolMapping, Duration)>,
    {
        self.store
            .insert_many(mappings.into_iter().map(|(mapping, ttl)| {
                let key = mapping.key();
                let provider = mapping.provider.clone();
                let version = mapping.version;
                (provider, key, CachedEntry::new(mapping, version, epoch, ttl))
            }));
    }

    /// Remove every mapping of `provider`
    pub fn invalidate_by_provider(&self, provider: &ProviderId) -> usize {
        self.store.invalidate_provider(provider)
    }

    /// Mappings currently held for `provider`
    pub fn provider_len(&self, provider: &ProviderId) -> usize {
        self.store.provider_len(provider)
    }

    pub fn clear(&self) -> usize {
        self.store.clear()
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> LayerStatsSnapshot {
        self.store.stats()
    }
}

impl Default for SymbolCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, RuleVersion};

    fn mapping(provider: &str, source: &str, target: &str, version: u64) -> SymbolMapping {
        SymbolMapping {
            provider: ProviderId::from(provider),
            direction: Direction::ToStandard,
            source: source.into(),
            target: target.into(),
            version: RuleVersion(version),
            market: "US".into(),
        }
    }

    fn fresh(epoch: u64, version: Option<u64>) -> Freshness {
        Freshness {
            epoch,
            version: version.map(RuleVersion),
        }
    }

    const TTL: Duration = Duration::from_secs(600);

    #[test]
    fn test_put_many_and_get() {
        let cache = SymbolCache::new();
        cache.put_many(
            0,
            vec![
                (mapping("acme", "AAA", "AAA.US", 1), TTL),
                (mapping("acme", "BBB", "BBB.US", 1), TTL),
            ],
        );

        let key = SymbolKey::new(ProviderId::from("acme"), Direction::ToStandard, "AAA");
        assert_eq!(cache.get(&key, &fresh(0, Some(1))).unwrap().target, "AAA.US");

        let reverse = SymbolKey::new(ProviderId::from("acme"), Direction::FromStandard, "AAA");
        assert!(cache.get(&reverse, &fresh(0, Some(1))).is_none());
        assert_eq!(cache.provider_len(&ProviderId::from("acme")), 2);
    }

    #[test]
    fn test_version_mismatch_is_a_miss() {
        let cache = SymbolCache::new();
        cache.put_many(0, vec![(mapping("acme", "AAA", "AAA.US", 1), TTL)]);

        let key = SymbolKey::new(ProviderId::from("acme"), Direction::ToStandard, "AAA");
        assert!(cache.get(&key, &fresh(0, Some(2))).is_none());
        // Rejected entries are dropped, not kept around
        assert!(cache.is_empty());
    }

    #[test]
    fn test_epoch_mismatch_is_a_miss() {
        let cache = SymbolCache::new();
        cache.put_many(0, vec![(mapping("acme", "AAA", "AAA.US", 1), TTL)]);

        let key = SymbolKey::new(ProviderId::from("acme"), Direction::ToStandard, "AAA");
        assert!(cache.get(&key, &fresh(1, None)).is_none());
    }

    #[test]
    fn test_invalidate_by_provider_leaves_others() {
        let cache = SymbolCache::new();
        cache.put_many(
            0,
            vec![
                (mapping("acme", "AAA", "AAA.US", 1), TTL),
                (mapping("acme", "BBB", "BBB.US", 1), TTL),
                (mapping("gamma", "AAA", "AAA.L", 1), TTL),
            ],
        );

        assert_eq!(cache.invalidate_by_provider(&ProviderId::from("acme")), 2);
        assert_eq!(cache.len(), 1);

        let key = SymbolKey::new(ProviderId::from("gamma"), Direction::ToStandard, "AAA");
        assert!(cache.get(&key, &fresh(0, Some(1))).is_some());
    }
}
