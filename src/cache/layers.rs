//! Cache Layers
//!
//! Owns L1, L2, L3 and the coherence registry, and is the only place that
//! writes into them. Provider invalidation cascades L1 → L2 → L3 under the
//! provider's exclusive gate; whole-layer clearing serves the memory monitor.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::bounded::LayerStatsSnapshot;
use super::coherence::{CoherenceRegistry, Freshness};
use super::digest::BatchDigest;
use super::entry::{BatchResult, SymbolMapping};
use super::l1::{L1Config, RuleCache};
use super::l2::{L2Config, SymbolCache};
use super::l3::{BatchResultCache, L3Config};
use crate::domain::ProviderId;
use crate::error::{Error, Result};
use crate::mapping::CompiledRuleSet;

// =============================================================================
// Tiers
// =============================================================================

/// Cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// L1 - compiled rule sets
    L1,
    /// L2 - resolved symbols
    L2,
    /// L3 - batch results
    L3,
}

impl CacheTier {
    pub const ALL: [CacheTier; 3] = [CacheTier::L1, CacheTier::L2, CacheTier::L3];

    /// Order in which layers are shed under memory pressure
    pub const CLEANUP_ORDER: [CacheTier; 3] = [CacheTier::L3, CacheTier::L2, CacheTier::L1];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::L1 => "l1",
            CacheTier::L2 => "l2",
            CacheTier::L3 => "l3",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "L1 (rules)"),
            CacheTier::L2 => write!(f, "L2 (symbols)"),
            CacheTier::L3 => write!(f, "L3 (batches)"),
        }
    }
}

/// Entry-count bounds of all layers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerLimits {
    pub l1: L1Config,
    pub l2: L2Config,
    pub l3: L3Config,
}

impl LayerLimits {
    pub fn validate(&self) -> Result<()> {
        for (tier, max) in [
            (CacheTier::L1, self.l1.max_entries),
            (CacheTier::L2, self.l2.max_entries),
            (CacheTier::L3, self.l3.max_entries),
        ] {
            if max == 0 {
                return Err(Error::Config(format!("{} max entries must be positive", tier)));
            }
        }
        Ok(())
    }
}

/// Entry counts per layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerCounts {
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
}

impl LayerCounts {
    pub fn get(&self, tier: CacheTier) -> usize {
        match tier {
            CacheTier::L1 => self.l1,
            CacheTier::L2 => self.l2,
            CacheTier::L3 => self.l3,
        }
    }

    pub fn total(&self) -> usize {
        self.l1 + self.l2 + self.l3
    }
}

/// Statistics of every layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerStats {
    pub l1: LayerStatsSnapshot,
    pub l2: LayerStatsSnapshot,
    pub l3: LayerStatsSnapshot,
}

/// What a provider invalidation removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub provider: ProviderId,
    /// Epoch in force after the invalidation
    pub epoch: u64,
    pub rules_removed: bool,
    pub symbols_removed: usize,
    pub batches_removed: usize,
}

// =============================================================================
// Control Seams
// =============================================================================

/// Cascade invalidation of one provider, used by the change feed watcher
pub trait ProviderInvalidator: Send + Sync {
    fn invalidate_provider(&self, provider: &ProviderId) -> InvalidationReport;
}

/// Whole-layer control, used by the memory monitor
pub trait LayerControl: Send + Sync {
    /// Drop every entry of `tier`; returns how many were held
    fn clear_layer(&self, tier: CacheTier) -> usize;

    fn entry_counts(&self) -> LayerCounts;
}

// =============================================================================
// Cache Layers
// =============================================================================

/// The three cache layers plus their coherence state
pub struct CacheLayers {
    rules: RuleCache,
    symbols: SymbolCache,
    batches: BatchResultCache,
    coherence: CoherenceRegistry,
}

impl CacheLayers {
    pub fn new(limits: &LayerLimits) -> Self {
        Self {
            rules: RuleCache::with_config(limits.l1.clone()),
            symbols: SymbolCache::with_config(limits.l2.clone()),
            batches: BatchResultCache::with_config(limits.l3.clone()),
            coherence: CoherenceRegistry::new(),
        }
    }

    pub fn rules(&self) -> &RuleCache {
        &self.rules
    }

    pub fn symbols(&self) -> &SymbolCache {
        &self.symbols
    }

    pub fn batches(&self) -> &BatchResultCache {
        &self.batches
    }

    pub fn coherence(&self) -> &CoherenceRegistry {
        &self.coherence
    }

    pub fn freshness(&self, provider: &ProviderId) -> Freshness {
        self.coherence.freshness(provider)
    }

    pub fn epoch(&self, provider: &ProviderId) -> u64 {
        self.coherence.epoch(provider)
    }

    /// L1 lookup under the provider's epoch
    pub fn rule_set(&self, provider: &ProviderId, epoch: u64) -> Option<Arc<CompiledRuleSet>> {
        self.rules.get(provider, epoch)
    }

    /// Install a freshly loaded rule set; false when an invalidation
    /// happened since `epoch` was read
    pub fn install_rule_set(&self, rule_set: Arc<CompiledRuleSet>, epoch: u64, ttl: Duration) -> bool {
        let provider = rule_set.provider().clone();
        let version = rule_set.version();
        self.coherence
            .admit_version(&provider, epoch, version, || {
                self.rules.put(rule_set, epoch, ttl)
            })
            .is_some()
    }

    /// Write mappings computed under `epoch` into L2
    pub fn store_symbols(
        &self,
        provider: &ProviderId,
        epoch: u64,
        mappings: Vec<(SymbolMapping, Duration)>,
    ) -> bool {
        if mappings.is_empty() {
            return true;
        }
        self.coherence
            .admit(provider, epoch, || self.symbols.put_many(epoch, mappings))
            .is_some()
    }

    /// Write a batch computed under `epoch` into L3
    pub fn store_batch(
        &self,
        digest: BatchDigest,
        result: Arc<BatchResult>,
        epoch: u64,
        ttl: Duration,
    ) -> bool {
        let provider = result.provider.clone();
        self.coherence
            .admit(&provider, epoch, || self.batches.put(digest, result, epoch, ttl))
            .is_some()
    }

    /// Drop TTL-expired entries in every layer
    pub fn purge_expired(&self) -> LayerCounts {
        let purged = LayerCounts {
            l1: self.rules.purge_expired(),
            l2: self.symbols.purge_expired(),
            l3: self.batches.purge_expired(),
        };
        if purged.total() > 0 {
            debug!(l1 = purged.l1, l2 = purged.l2, l3 = purged.l3, "Purged expired entries");
        }
        purged
    }

    pub fn stats(&self) -> LayerStats {
        LayerStats {
            l1: self.rules.stats(),
            l2: self.symbols.stats(),
            l3: self.batches.stats(),
        }
    }
}

impl ProviderInvalidator for CacheLayers {
    fn invalidate_provider(&self, provider: &ProviderId) -> InvalidationReport {
        let (epoch, (rules_removed, symbols_removed, batches_removed)) =
            self.coherence.invalidate(provider, || {
                let rules = self.rules.invalidate(provider);
                let symbols = self.symbols.invalidate_by_provider(provider);
                let batches = self.batches.invalidate_by_provider(provider);
                (rules, symbols, batches)
            });

        info!(
            provider = %provider,
            epoch,
            rules_removed,
            symbols_removed,
            batches_removed,
            "Invalidated provider"
        );

        InvalidationReport {
            provider: provider.clone(),
            epoch,
            rules_removed,
            symbols_removed,
            batches_removed,
        }
    }
}

impl LayerControl for CacheLayers {
    fn clear_layer(&self, tier: CacheTier) -> usize {
        match tier {
            CacheTier::L1 => {
                let cleared = self.rules.clear();
                self.coherence.forget_all_versions();
                cleared
            }
            CacheTier::L2 => self.symbols.clear(),
            CacheTier::L3 => self.batches.clear(),
        }
    }

    fn entry_counts(&self) -> LayerCounts {
        LayerCounts {
            l1: self.rules.len(),
            l2: self.symbols.len(),
            l3: self.batches.len(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
