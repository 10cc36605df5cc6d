//! L1 Cache - Compiled Rule Sets
//!
//! One entry per provider. Reads never extend an entry's life: a rule set
//! stays until its TTL runs out, it is invalidated, or LRU pushes it out.
//! The cache never talks to the backing store; loading on miss is the
//! orchestrator's job.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bounded::{BoundedLru, LayerStatsSnapshot};
use super::entry::CachedEntry;
use crate::domain::ProviderId;
use crate::mapping::CompiledRuleSet;

/// L1 configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L1Config {
    /// Maximum number of provider rule sets held
    pub max_entries: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self { max_entries: 1_000 }
    }
}

/// L1 cache of compiled rule sets keyed by provider
pub struct RuleCache {
    store: BoundedLru<ProviderId, Arc<CompiledRuleSet>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::with_config(L1Config::default())
    }

    pub fn with_config(config: L1Config) -> Self {
        Self {
            store: BoundedLru::new(config.max_entries),
        }
    }

    /// Rule set of `provider` if present, live, and loaded under `epoch`
    pub fn get(&self, provider: &ProviderId, epoch: u64) -> Option<Arc<CompiledRuleSet>> {
        self.store
            .get_if(provider, |entry| entry.epoch() == epoch)
            .map(CachedEntry::into_value)
    }

    /// Install a rule set, replacing any previous one for the provider
    pub fn put(&self, rule_set: Arc<CompiledRuleSet>, epoch: u64, ttl: Duration) {
        let provider = rule_set.provider().clone();
        let entry = CachedEntry::new(Arc::clone(&rule_set), rule_set.version(), epoch, ttl);
        self.store.insert(provider.clone(), provider, entry);
    }

    /// Drop the provider's rule set; returns whether one was held
    pub fn invalidate(&self, provider: &ProviderId) -> bool {
        self.store.invalidate_provider(provider) > 0
    }

    pub fn contains(&self, provider: &ProviderId) -> bool {
        self.store.contains(provider)
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

impl Default for RuleCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
