//! Cache Metrics Collection
//!
//! Lock-free counters for the request path and background tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::layers::CacheTier;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Per-layer lookups as seen by the request path
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l3_hits: AtomicU64,
    l3_misses: AtomicU64,

    // Requests
    requests: AtomicU64,
    symbols_mapped: AtomicU64,
    symbols_failed: AtomicU64,
    disabled_fallbacks: AtomicU64,
    internal_fallbacks: AtomicU64,
    forced_refreshes: AtomicU64,
    request_latency_us: AtomicU64,

    // Backing store
    rule_loads: AtomicU64,
    rule_load_failures: AtomicU64,
    dedup_joins: AtomicU64,
    query_timeouts: AtomicU64,

    // Coherence and memory
    invalidations: AtomicU64,
    memory_cleanups: AtomicU64,
    cleanup_failures: AtomicU64,
    entries_shed: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup_counters(&self, tier: CacheTier) -> (&AtomicU64, &AtomicU64) {
        match tier {
            CacheTier::L1 => (&self.l1_hits, &self.l1_misses),
            CacheTier::L2 => (&self.l2_hits, &self.l2_misses),
            CacheTier::L3 => (&self.l3_hits, &self.l3_misses),
        }
    }

    pub fn record_hit(&self, tier: CacheTier) {
        self.record_hits(tier, 1);
    }

    pub fn record_miss(&self, tier: CacheTier) {
        self.record_misses(tier, 1);
    }

    pub fn record_hits(&self, tier: CacheTier, count: u64) {
        self.lookup_counters(tier).0.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_misses(&self, tier: CacheTier, count: u64) {
        self.lookup_counters(tier).1.fetch_add(count, Ordering::Relaxed);
    }

    pub fn hits(&self, tier: CacheTier) -> u64 {
        self.lookup_counters(tier).0.load(Ordering::Relaxed)
    }

    pub fn misses(&self, tier: CacheTier) -> u64 {
        self.lookup_counters(tier).1.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self, tier: CacheTier) -> f64 {
        let hits = self.hits(tier) as f64;
        let total = hits + self.misses(tier) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Record a finished request
    pub fn record_request(&self, mapped: usize, failed: usize, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.symbols_mapped.fetch_add(mapped as u64, Ordering::Relaxed);
        self.symbols_failed.fetch_add(failed as u64, Ordering::Relaxed);
        self.update_latency_ema(&self.request_latency_us, latency);
    }

    pub fn record_disabled_fallback(&self) {
        self.disabled_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_internal_fallback(&self) {
        self.internal_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_refresh(&self) {
        self.forced_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rule_load(&self, ok: bool) {
        self.rule_loads.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.rule_load_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dedup_join(&self) {
        self.dedup_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_timeout(&self) {
        self.query_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup(&self, entries_shed: usize, succeeded: bool) {
        self.memory_cleanups.fetch_add(1, Ordering::Relaxed);
        self.entries_shed
            .fetch_add(entries_shed as u64, Ordering::Relaxed);
        if !succeeded {
            self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn rule_loads(&self) -> u64 {
        self.rule_loads.load(Ordering::Relaxed)
    }

    pub fn request_latency(&self) -> Duration {
        Duration::from_micros(self.request_latency_us.load(Ordering::Relaxed))
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            l1_hits: load(&self.l1_hits),
            l1_misses: load(&self.l1_misses),
            l1_hit_ratio: self.hit_ratio(CacheTier::L1),
            l2_hits: load(&self.l2_hits),
            l2_misses: load(&self.l2_misses),
            l2_hit_ratio: self.hit_ratio(CacheTier::L2),
            l3_hits: load(&self.l3_hits),
            l3_misses: load(&self.l3_misses),
            l3_hit_ratio: self.hit_ratio(CacheTier::L3),

            requests: load(&self.requests),
            symbols_mapped: load(&self.symbols_mapped),
            symbols_failed: load(&self.symbols_failed),
            disabled_fallbacks: load(&self.disabled_fallbacks),
            internal_fallbacks: load(&self.internal_fallbacks),
            forced_refreshes: load(&self.forced_refreshes),
            request_latency_us: load(&self.request_latency_us),

            rule_loads: load(&self.rule_loads),
            rule_load_failures: load(&self.rule_load_failures),
            dedup_joins: load(&self.dedup_joins),
            query_timeouts: load(&self.query_timeouts),

            invalidations: load(&self.invalidations),
            memory_cleanups: load(&self.memory_cleanups),
            cleanup_failures: load(&self.cleanup_failures),
            entries_shed: load(&self.entries_shed),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    // L1
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_hit_ratio: f64,

    // L2
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_hit_ratio: f64,

    // L3
    pub l3_hits: u64,
    pub l3_misses: u64,
    pub l3_hit_ratio: f64,

    // Requests
    pub requests: u64,
    pub symbols_mapped: u64,
    pub symbols_failed: u64,
    pub disabled_fallbacks: u64,
    pub internal_fallbacks: u64,
    pub forced_refreshes: u64,
    pub request_latency_us: u64,

    // Backing store
    pub rule_loads: u64,
    pub rule_load_failures: u64,
    pub dedup_joins: u64,
    pub query_timeouts: u64,

    // Coherence and memory
    pub invalidations: u64,
    pub memory_cleanups: u64,
    pub cleanup_failures: u64,
    pub entries_shed: u64,
}

// =============================================================================
// Tests
// =============================================================================
