//! L3 Cache - Batch Results
//!
//! Whole batch outcomes keyed by [`BatchDigest`]. The shortest-lived layer
//! and the first one shed under memory pressure.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bounded::{BoundedLru, LayerStatsSnapshot};
use super::coherence::Freshness;
use super::digest::BatchDigest;
use super::entry::{BatchResult, CachedEntry};
use crate::domain::{ProviderId, RuleVersion};

/// L3 configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L3Config {
    /// Maximum number of batch results held
    pub max_entries: usize,
}

impl Default for L3Config {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
        }
    }
}

/// L3 cache of batch results
pub struct BatchResultCache {
    store: BoundedLru<BatchDigest, Arc<BatchResult>>,
}

impl BatchResultCache {
    pub fn new() -> Self {
        Self::with_config(L3Config::default())
    }

    pub fn with_config(config: L3Config) -> Self {
        Self {
            store: BoundedLru::new(config.max_entries),
        }
    }

    /// Batch result if live and still matching `freshness`
    pub fn get(&self, digest: &BatchDigest, freshness: &Freshness) -> Option<Arc<BatchResult>> {
        self.store
            .get_if(digest, |entry| freshness.admits(entry))
            .map(CachedEntry::into_value)
    }

    /// Batch result looked up by digest alone; the provider's freshness is
    /// resolved from the stored entry
    pub fn get_by_digest<F>(&self, digest: &BatchDigest, freshness_of: F) -> Option<Arc<BatchResult>>
    where
        F: FnOnce(&ProviderId) -> Freshness,
    {
        self.store
            .get_if(digest, |entry| freshness_of(&entry.value().provider).admits(entry))
            .map(CachedEntry::into_value)
    }

    /// Store a batch result tagged with its newest contributing version
    pub fn put(&self, digest: BatchDigest, result: Arc<BatchResult>, epoch: u64, ttl: Duration) {
        let provider = result.provider.clone();
        let version = result.newest_version().unwrap_or(RuleVersion::default());
        self.store
            .insert(provider, digest, CachedEntry::new(result, version, epoch, ttl));
    }

    /// Remove every batch of `provider`
    pub fn invalidate_by_provider(&self, provider: &ProviderId) -> usize {
        self.store.invalidate_provider(provider)
    }

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

impl Default for BatchResultCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;
    use crate::mapping::SymbolOutcome;
    use std::collections::BTreeMap;

    fn batch(provider: &str, version: u64) -> (BatchDigest, Arc<BatchResult>) {
        let provider = ProviderId::from(provider);
        let mut outcomes = BTreeMap::new();
        outcomes.insert("AAA".to_string(), SymbolOutcome::mapped("AAA.US"));
        let digest = BatchDigest::compute(&provider, Direction::ToStandard, &["AAA"]);
        let result = BatchResult::new(
            provider,
            Direction::ToStandard,
            outcomes,
            [RuleVersion(version)].into_iter().collect(),
        );
        (digest, Arc::new(result))
    }

    #[test]
    fn test_put_get_by_digest() {
        let cache = BatchResultCache::new();
        let (digest, result) = batch("acme", 1);
        cache.put(digest.clone(), result, 0, Duration::from_secs(60));

        let fresh = Freshness {
            epoch: 0,
            version: Some(RuleVersion(1)),
        };
        let hit = cache.get(&digest, &fresh).unwrap();
        assert_eq!(hit.outcomes["AAA"].target(), Some("AAA.US"));
    }

    #[test]
    fn test_stale_version_rejected() {
        let cache = BatchResultCache::new();
        let (digest, result) = batch("acme", 1);
        cache.put(digest.clone(), result, 0, Duration::from_secs(60));

        let fresh = Freshness {
            epoch: 0,
            version: Some(RuleVersion(2)),
        };
        assert!(cache.get(&digest, &fresh).is_none());
    }

    #[test]
    fn test_get_by_digest_resolves_provider_freshness() {
        let cache = BatchResultCache::new();
        let (digest, result) = batch("acme", 1);
        cache.put(digest.clone(), result, 3, Duration::from_secs(60));

        let hit = cache.get_by_digest(&digest, |provider| {
            assert_eq!(provider.as_str(), "acme");
            Freshness {
                epoch: 3,
                version: None,
            }
        });
        assert!(hit.is_some());

        let miss = cache.get_by_digest(&digest, |_| Freshness {
            epoch: 4,
            version: None,
        });
        assert!(miss.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_by_provider() {
        let cache = BatchResultCache::new();
        let (acme_digest, acme) = batch("acme", 1);
        let (gamma_digest, gamma) = batch("gamma", 1);
        cache.put(acme_digest, acme, 0, Duration::from_secs(60));
        cache.put(gamma_digest.clone(), gamma, 0, Duration::from_secs(60));

        assert_eq!(cache.invalidate_by_provider(&ProviderId::from("acme")), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.provider_len(&ProviderId::from("gamma")), 1);
    }
}
