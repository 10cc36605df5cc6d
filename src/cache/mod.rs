//! Three-Tier Symbol Mapping Cache
//!
//! Rule sets, resolved symbols and whole batch results, each in its own
//! bounded layer with its own lifetime.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        SymbolMappingCache                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 RuleCache          │ L2 SymbolCache        │ L3 BatchResultCache     │
//! │  ┌──────────────────┐  │ ┌──────────────────┐  │ ┌────────────────────┐  │
//! │  │ provider →       │  │ │ (provider, dir,  │  │ │ digest →           │  │
//! │  │ CompiledRuleSet  │  │ │  symbol) → map   │  │ │ BatchResult        │  │
//! │  │ TTL: ~24h        │  │ │ TTL: ~12h        │  │ │ TTL: ~5min         │  │
//! │  └──────────────────┘  │ └──────────────────┘  │ └────────────────────┘  │
//! │          │             │          │            │           │             │
//! │          └─────────────┴──────────┴────────────┴───────────┘             │
//! │                                │                                         │
//! │              CoherenceRegistry (per-provider gate + epoch)               │
//! │              QueryDeduplicator (batch@epoch, rules@epoch)                │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Invalidation
//!
//! A provider invalidation clears L1, then L2, then L3 while holding the
//! provider's exclusive gate. Entries are tagged with the epoch and rule
//! version they were computed under, so nothing computed before the
//! invalidation is stored or served after it.
//!
//! # Memory Pressure
//!
//! Layers are shed whole in the order L3 → L2 → L1.

mod bounded;
mod coherence;
mod dedup;
mod digest;
mod entry;
mod l1;
mod l2;
mod l3;
mod layers;
mod manager;
mod metrics;
mod policy;

#[cfg(test)]
mod proptest;

pub use bounded::{BoundedLru, LayerStatsSnapshot};
pub use coherence::{CoherenceRegistry, Freshness};
pub use dedup::{DedupStatsSnapshot, QueryDeduplicator, QueryRole, DEFAULT_QUERY_TIMEOUT};
pub use digest::BatchDigest;
pub use entry::{BatchResult, CachedEntry, SymbolKey, SymbolMapping};
pub use l1::{L1Config, RuleCache};
pub use l2::{L2Config, SymbolCache};
pub use l3::{BatchResultCache, L3Config};
pub use layers::{
    CacheLayers, CacheTier, InvalidationReport, LayerControl, LayerCounts, LayerLimits,
    LayerStats, ProviderInvalidator,
};
pub use manager::{
    BatchMappingResult, FallbackReason, LayerHits, MapOptions, MappingMetadata,
    SymbolMappingCache, TierCounts,
};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use policy::{DynamicTtlCalculator, LayerTtlBounds, TtlPolicy};
