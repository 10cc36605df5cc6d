//! Symbol Mapping Cache - Orchestrator
//!
//! Serves `map_symbols` through L3 → L2 → L1 and keeps the background
//! change feed watcher and memory monitor running beside the request path.
//!
//! ```text
//! map_symbols(provider, direction, symbols)
//!   │
//!   ├─ disabled? ──────────────────────────────▶ direct store path
//!   ├─ L3 digest hit? ─────────────────────────▶ return
//!   └─ dedup(batch:digest@epoch)
//!        ├─ L2 per symbol
//!        ├─ L1 (dedup(rules:provider@epoch) on miss)
//!        ├─ resolve in memory
//!        └─ write L2 + L3 under the epoch
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::dedup::{QueryDeduplicator, QueryRole};
use super::digest::BatchDigest;
use super::entry::{BatchResult, SymbolKey, SymbolMapping};
use super::layers::{
    CacheLayers, CacheTier, InvalidationReport, LayerControl, LayerCounts, LayerStats,
    ProviderInvalidator,
};
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::policy::DynamicTtlCalculator;
use crate::config::EngineConfig;
use crate::domain::{
    CacheEvent, ChangeFeed, Direction, EventPublisher, MarketSession, MarketSessionSource,
    MemoryProbe, ProviderId, RuleStore, RuleVersion,
};
use crate::error::{Error, Result};
use crate::feed::ChangeFeedWatcher;
use crate::mapping::{CompiledRuleSet, MappingFailure, SymbolOutcome};
use crate::monitoring::{ComponentHealth, HealthCheck, HealthResponse, MemoryWatermarkMonitor};

// =============================================================================
// Request / Result Types
// =============================================================================

/// Per-request options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapOptions {
    /// Skip every cache layer on read; the fresh result is written back
    pub force_refresh: bool,
}

impl MapOptions {
    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
        }
    }
}

/// Why a request bypassed the cache layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Caching is switched off by configuration
    Disabled,
    /// The cached path failed unexpectedly
    InternalError,
}

/// Hit/miss counts of one layer for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub hits: usize,
    pub misses: usize,
}

impl TierCounts {
    fn hit(count: usize) -> Self {
        Self {
            hits: count,
            misses: 0,
        }
    }

    fn miss(count: usize) -> Self {
        Self {
            hits: 0,
            misses: count,
        }
    }
}

/// Hit/miss counts of every layer for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerHits {
    pub l1: TierCounts,
    pub l2: TierCounts,
    pub l3: TierCounts,
}

/// Request metadata returned alongside the per-symbol outcomes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingMetadata {
    pub digest: BatchDigest,
    pub success_count: usize,
    pub failure_count: usize,
    pub layer_hits: LayerHits,
    pub rule_versions: BTreeSet<RuleVersion>,
    /// The request was served without the cache layers
    pub disabled_fallback: bool,
    pub fallback_reason: Option<FallbackReason>,
    pub forced_refresh: bool,
    /// The request joined a resolution another caller had started
    pub deduplicated: bool,
    pub elapsed: Duration,
}

/// Result of one `map_symbols` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchMappingResult {
    pub provider: ProviderId,
    pub direction: Direction,
    pub outcomes: BTreeMap<String, SymbolOutcome>,
    pub metadata: MappingMetadata,
}

impl BatchMappingResult {
    fn new(batch: &BatchResult, digest: BatchDigest, started: Instant) -> Self {
        Self {
            provider: batch.provider.clone(),
            direction: batch.direction,
            outcomes: batch.outcomes.clone(),
            metadata: MappingMetadata {
                digest,
                success_count: batch.success_count,
                failure_count: batch.failure_count,
                layer_hits: LayerHits::default(),
                rule_versions: batch.rule_versions.clone(),
                disabled_fallback: false,
                fallback_reason: None,
                forced_refresh: false,
                deduplicated: false,
                elapsed: started.elapsed(),
            },
        }
    }

    fn with_layer_hits(mut self, hits: LayerHits) -> Self {
        self.metadata.layer_hits = hits;
        self
    }

    fn with_fallback(mut self, reason: FallbackReason) -> Self {
        self.metadata.disabled_fallback = true;
        self.metadata.fallback_reason = Some(reason);
        self
    }

    /// Every symbol mapped
    pub fn is_success(&self) -> bool {
        self.metadata.failure_count == 0
    }

    pub fn outcome(&self, symbol: &str) -> Option<&SymbolOutcome> {
        self.outcomes.get(symbol)
    }

    /// Mapped target of `symbol`, if it mapped
    pub fn target(&self, symbol: &str) -> Option<&str> {
        self.outcome(symbol).and_then(SymbolOutcome::target)
    }
}

/// Batch resolution shared by deduplicated callers
#[derive(Debug)]
struct ResolvedBatch {
    result: Arc<BatchResult>,
    l1: TierCounts,
    l2: TierCounts,
}

#[derive(Default)]
struct Background {
    cancel: Option<CancellationToken>,
    watcher: Option<Arc<ChangeFeedWatcher>>,
    monitor: Option<Arc<MemoryWatermarkMonitor>>,
    handles: Vec<JoinHandle<()>>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Three-layer symbol mapping cache
pub struct SymbolMappingCache {
    config: EngineConfig,
    store: Arc<dyn RuleStore>,
    sessions: Arc<dyn MarketSessionSource>,
    publisher: Arc<dyn EventPublisher>,
    layers: Arc<CacheLayers>,
    ttl: DynamicTtlCalculator,
    metrics: Arc<CacheMetrics>,
    batch_dedup: QueryDeduplicator<Arc<ResolvedBatch>>,
    rule_dedup: QueryDeduplicator<Arc<CompiledRuleSet>>,
    health: HealthCheck,
    background: Mutex<Background>,
}

impl SymbolMappingCache {
    /// Build an engine; the configuration is validated here
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RuleStore>,
        sessions: Arc<dyn MarketSessionSource>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let engine = Self {
            layers: Arc::new(CacheLayers::new(&config.layers)),
            ttl: DynamicTtlCalculator::new(config.ttl.clone()),
            metrics: Arc::new(CacheMetrics::new()),
            batch_dedup: QueryDeduplicator::new(config.query_timeout),
            rule_dedup: QueryDeduplicator::new(config.query_timeout),
            health: HealthCheck::new(),
            background: Mutex::new(Background::default()),
            config,
            store,
            sessions,
            publisher,
        };
        engine.health.set_ready(true);

        info!(
            enabled = engine.config.enabled,
            l1_max = engine.config.layers.l1.max_entries,
            l2_max = engine.config.layers.l2.max_entries,
            l3_max = engine.config.layers.l3.max_entries,
            query_timeout_ms = engine.config.query_timeout.as_millis() as u64,
            "Symbol mapping cache created"
        );
        Ok(Arc::new(engine))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layers(&self) -> &Arc<CacheLayers> {
        &self.layers
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn layer_stats(&self) -> LayerStats {
        self.layers.stats()
    }

    // =========================================================================
    // Request Path
    // =========================================================================

    /// Map a batch of symbols of one provider.
    ///
    /// Only a malformed request is an `Err`; every other failure is reported
    /// per symbol.
    #[instrument(skip(self, symbols, options), fields(provider = %provider, direction = %direction, count = symbols.len()))]
    pub async fn map_symbols<S: AsRef<str>>(
        self: &Arc<Self>,
        provider: &ProviderId,
        direction: Direction,
        symbols: &[S],
        options: MapOptions,
    ) -> Result<BatchMappingResult> {
        let started = Instant::now();
        let symbols = self.normalize_request(provider, symbols)?;
        let digest = BatchDigest::compute(provider, direction, &symbols);

        let result = if !self.config.enabled {
            self.metrics.record_disabled_fallback();
            self.map_direct(provider, direction, &symbols, digest, started)
                .await
                .with_fallback(FallbackReason::Disabled)
        } else if options.force_refresh {
            self.metrics.record_forced_refresh();
            self.map_refreshed(provider, direction, &symbols, digest, started)
                .await
        } else {
            match self
                .map_cached(provider, direction, symbols.clone(), digest.clone(), started)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Cached path failed, serving from backing store");
                    self.metrics.record_internal_fallback();
                    self.map_direct(provider, direction, &symbols, digest, started)
                        .await
                        .with_fallback(FallbackReason::InternalError)
                }
            }
        };

        self.metrics.record_request(
            result.metadata.success_count,
            result.metadata.failure_count,
            started.elapsed(),
        );
        Ok(result)
    }

    /// Map symbols of several providers at once; each provider succeeds or
    /// fails independently
    pub async fn map_mixed<S: AsRef<str>>(
        self: &Arc<Self>,
        direction: Direction,
        requests: &[(ProviderId, Vec<S>)],
        options: MapOptions,
    ) -> Result<BTreeMap<ProviderId, BatchMappingResult>> {
        let mut grouped: BTreeMap<ProviderId, Vec<String>> = BTreeMap::new();
        for (provider, symbols) in requests {
            grouped
                .entry(provider.clone())
                .or_default()
                .extend(symbols.iter().map(|s| s.as_ref().to_string()));
        }
        if grouped.is_empty() {
            return Err(Error::MalformedRequest("no providers requested".into()));
        }
        // Fail fast before doing any work
        for (provider, symbols) in &grouped {
            self.normalize_request(provider, symbols.as_slice())?;
        }

        let results = join_all(grouped.iter().map(|(provider, symbols)| async move {
            let result = self
                .map_symbols(provider, direction, symbols.as_slice(), options)
                .await;
            (provider.clone(), result)
        }))
        .await;

        results
            .into_iter()
            .map(|(provider, result)| result.map(|r| (provider, r)))
            .collect()
    }

    /// Still-valid L3 entry for a digest handed out earlier
    pub fn cached_batch(&self, digest: &str) -> Result<Option<Arc<BatchResult>>> {
        let digest = BatchDigest::parse(digest)?;
        Ok(self
            .layers
            .batches()
            .get_by_digest(&digest, |provider| self.layers.freshness(provider)))
    }

    fn normalize_request<S: AsRef<str>>(
        &self,
        provider: &ProviderId,
        symbols: &[S],
    ) -> Result<Vec<String>> {
        provider.validate()?;
        if symbols.is_empty() {
            return Err(Error::MalformedRequest("symbol list is empty".into()));
        }
        if symbols.len() > self.config.max_batch_size {
            return Err(Error::MalformedRequest(format!(
                "batch of {} symbols exceeds the limit of {}",
                symbols.len(),
                self.config.max_batch_size
            )));
        }

        let mut unique = BTreeSet::new();
        for (position, symbol) in symbols.iter().enumerate() {
            let symbol = symbol.as_ref().trim();
            if symbol.is_empty() {
                return Err(Error::MalformedRequest(format!(
                    "blank symbol at position {}",
                    position
                )));
            }
            unique.insert(symbol.to_string());
        }
        Ok(unique.into_iter().collect())
    }

    async fn map_cached(
        self: &Arc<Self>,
        provider: &ProviderId,
        direction: Direction,
        symbols: Vec<String>,
        digest: BatchDigest,
        started: Instant,
    ) -> Result<BatchMappingResult> {
        let freshness = self.layers.freshness(provider);

        if let Some(batch) = self.layers.batches().get(&digest, &freshness) {
            self.metrics.record_hit(CacheTier::L3);
            debug!(digest = %digest, "L3 hit");
            return Ok(BatchMappingResult::new(&batch, digest, started).with_layer_hits(
                LayerHits {
                    l3: TierCounts::hit(1),
                    ..LayerHits::default()
                },
            ));
        }
        self.metrics.record_miss(CacheTier::L3);

        let epoch = freshness.epoch;
        let key = digest.dedup_key(epoch);
        let this = Arc::clone(self);
        let work_provider = provider.clone();
        let work_symbols = symbols.clone();
        let work_digest = digest.clone();
        let (outcome, role) = self
            .batch_dedup
            .run_tracked(&key, move || async move {
                this.resolve_batch(work_provider, direction, work_symbols, work_digest, epoch)
                    .await
            })
            .await;

        let deduplicated = role == QueryRole::Follower;
        if deduplicated {
            self.metrics.record_dedup_join();
        }

        let resolved = match outcome {
            Ok(resolved) => resolved,
            Err(e @ Error::QueryTimeout { .. }) => {
                if role == QueryRole::Leader {
                    self.metrics.record_query_timeout();
                }
                warn!(digest = %digest, error = %e, "Batch resolution timed out");
                let failure = MappingFailure::from(&e);
                let outcomes = symbols
                    .into_iter()
                    .map(|s| (s, SymbolOutcome::failed(failure.clone())))
                    .collect();
                let batch = BatchResult::new(provider.clone(), direction, outcomes, BTreeSet::new());
                let mut result = BatchMappingResult::new(&batch, digest, started);
                result.metadata.deduplicated = deduplicated;
                return Ok(result);
            }
            Err(e) => return Err(e),
        };

        let mut result = BatchMappingResult::new(&resolved.result, digest, started).with_layer_hits(
            LayerHits {
                l1: resolved.l1,
                l2: resolved.l2,
                l3: TierCounts::miss(1),
            },
        );
        result.metadata.deduplicated = deduplicated;
        Ok(result)
    }

    /// L2 lookups, rule application for the rest, and write-back
    async fn resolve_batch(
        self: Arc<Self>,
        provider: ProviderId,
        direction: Direction,
        symbols: Vec<String>,
        digest: BatchDigest,
        epoch: u64,
    ) -> Result<Arc<ResolvedBatch>> {
        let freshness = self.layers.freshness(&provider);
        let mut outcomes = BTreeMap::new();
        let mut versions = BTreeSet::new();
        let mut markets = BTreeSet::new();
        let mut from_l2 = Vec::new();
        let mut missing = Vec::new();

        if freshness.epoch == epoch {
            for symbol in symbols {
                let key = SymbolKey::new(provider.clone(), direction, symbol.clone());
                match self.layers.symbols().get(&key, &freshness) {
                    Some(mapping) => from_l2.push(mapping),
                    None => missing.push(symbol),
                }
            }
        } else {
            missing = symbols;
        }

        let l2 = TierCounts {
            hits: from_l2.len(),
            misses: missing.len(),
        };
        self.metrics.record_hits(CacheTier::L2, l2.hits as u64);
        self.metrics.record_misses(CacheTier::L2, l2.misses as u64);

        let mut l1 = TierCounts::default();
        if !missing.is_empty() {
            match self.ensure_rule_set(&provider, epoch).await {
                Ok((rules, l1_hit)) => {
                    l1 = if l1_hit { TierCounts::hit(1) } else { TierCounts::miss(1) };

                    // Mappings from an older rule set are redone with this one
                    let (current, stale): (Vec<_>, Vec<_>) = from_l2
                        .drain(..)
                        .partition(|m: &SymbolMapping| m.version == rules.version());
                    from_l2 = current;
                    missing.extend(stale.into_iter().map(|m| m.source));

                    let fresh = self.apply_rules(&rules, direction, &missing, &mut outcomes);
                    versions.insert(rules.version());
                    markets.insert(rules.default_market().to_string());
                    markets.extend(fresh.iter().map(|m| m.market.clone()));

                    let entries: Vec<_> = fresh
                        .into_iter()
                        .map(|m| {
                            let ttl = self.ttl_for(CacheTier::L2, &m.market);
                            (m, ttl)
                        })
                        .collect();
                    if !self.layers.store_symbols(&provider, epoch, entries) {
                        debug!(provider = %provider, "Dropped L2 writes computed before an invalidation");
                    }
                }
                Err(e) => {
                    let failure = MappingFailure::from(&e);
                    warn!(provider = %provider, error = %e, "Rule set unavailable, failing affected symbols");
                    for symbol in missing.drain(..) {
                        outcomes.insert(symbol, SymbolOutcome::failed(failure.clone()));
                    }
                }
            }
        }

        for mapping in from_l2 {
            versions.insert(mapping.version);
            markets.insert(mapping.market.clone());
            outcomes.insert(mapping.source, SymbolOutcome::mapped(mapping.target));
        }

        let result = Arc::new(BatchResult::new(provider.clone(), direction, outcomes, versions));
        if result.is_cacheable() {
            let ttl = self.batch_ttl(&markets);
            if !self.layers.store_batch(digest, Arc::clone(&result), epoch, ttl) {
                debug!(provider = %provider, "Dropped L3 write computed before an invalidation");
            }
        }

        Ok(Arc::new(ResolvedBatch { result, l1, l2 }))
    }

    /// L1 lookup, loading through the rule deduplicator on a miss.
    /// Returns the rule set and whether it came from L1.
    async fn ensure_rule_set(
        self: &Arc<Self>,
        provider: &ProviderId,
        epoch: u64,
    ) -> Result<(Arc<CompiledRuleSet>, bool)> {
        if let Some(rules) = self.layers.rule_set(provider, epoch) {
            self.metrics.record_hit(CacheTier::L1);
            return Ok((rules, true));
        }
        self.metrics.record_miss(CacheTier::L1);

        let key = format!("rules:{}@{}", provider, epoch);
        let this = Arc::clone(self);
        let work_provider = provider.clone();
        let (outcome, role) = self
            .rule_dedup
            .run_tracked(&key, move || async move {
                this.load_and_install(&work_provider, epoch).await
            })
            .await;

        match role {
            QueryRole::Follower => self.metrics.record_dedup_join(),
            QueryRole::Leader => {
                if matches!(outcome, Err(Error::QueryTimeout { .. })) {
                    self.metrics.record_query_timeout();
                }
            }
        }
        outcome.map(|rules| (rules, false))
    }

    async fn load_and_install(&self, provider: &ProviderId, epoch: u64) -> Result<Arc<CompiledRuleSet>> {
        let rules = self.load_rule_set(provider).await?;
        let ttl = self.ttl_for(CacheTier::L1, rules.default_market());
        if !self.layers.install_rule_set(Arc::clone(&rules), epoch, ttl) {
            debug!(provider = %provider, "Discarded rule set loaded across an invalidation");
        }
        Ok(rules)
    }

    /// Point query against the backing store plus compilation
    async fn load_rule_set(&self, provider: &ProviderId) -> Result<Arc<CompiledRuleSet>> {
        let started = Instant::now();
        let loaded = self.store.load_rule_set(provider).await.and_then(|set| {
            if set.provider != *provider {
                return Err(Error::InvalidRuleSet {
                    provider: provider.to_string(),
                    reason: format!("store returned rules of '{}'", set.provider),
                });
            }
            CompiledRuleSet::compile(set)
        });

        match loaded {
            Ok(compiled) => {
                self.metrics.record_rule_load(true);
                info!(
                    provider = %provider,
                    version = %compiled.version(),
                    rules = compiled.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Loaded rule set"
                );
                self.publish(CacheEvent::rule_set_loaded(
                    provider,
                    compiled.version(),
                    compiled.len(),
                ))
                .await;
                Ok(Arc::new(compiled))
            }
            Err(e) => {
                self.metrics.record_rule_load(false);
                warn!(provider = %provider, error = %e, "Rule set load failed");
                Err(e)
            }
        }
    }

    fn apply_rules(
        &self,
        rules: &CompiledRuleSet,
        direction: Direction,
        symbols: &[String],
        outcomes: &mut BTreeMap<String, SymbolOutcome>,
    ) -> Vec<SymbolMapping> {
        let mut resolved = Vec::new();
        for symbol in symbols {
            match rules.resolve(direction, symbol) {
                Some(resolution) => {
                    outcomes.insert(symbol.clone(), SymbolOutcome::mapped(resolution.target.clone()));
                    resolved.push(SymbolMapping {
                        provider: rules.provider().clone(),
                        direction,
                        source: symbol.clone(),
                        target: resolution.target,
                        version: rules.version(),
                        market: resolution.market,
                    });
                }
                None => {
                    outcomes.insert(
                        symbol.clone(),
                        SymbolOutcome::failed(MappingFailure::NoMatchingRule),
                    );
                }
            }
        }
        resolved
    }

    /// Resolve straight from the backing store, touching no layer
    async fn resolve_uncached(
        &self,
        provider: &ProviderId,
        direction: Direction,
        symbols: &[String],
    ) -> (BatchResult, Option<(Arc<CompiledRuleSet>, Vec<SymbolMapping>)>) {
        let mut outcomes = BTreeMap::new();
        match self.load_rule_set(provider).await {
            Ok(rules) => {
                let resolved = self.apply_rules(&rules, direction, symbols, &mut outcomes);
                let versions = [rules.version()].into_iter().collect();
                let batch = BatchResult::new(provider.clone(), direction, outcomes, versions);
                (batch, Some((rules, resolved)))
            }
            Err(e) => {
                let failure = MappingFailure::from(&e);
                for symbol in symbols {
                    outcomes.insert(symbol.clone(), SymbolOutcome::failed(failure.clone()));
                }
                let batch = BatchResult::new(provider.clone(), direction, outcomes, BTreeSet::new());
                (batch, None)
            }
        }
    }

    async fn map_direct(
        &self,
        provider: &ProviderId,
        direction: Direction,
        symbols: &[String],
        digest: BatchDigest,
        started: Instant,
    ) -> BatchMappingResult {
        let (batch, _) = self.resolve_uncached(provider, direction, symbols).await;
        BatchMappingResult::new(&batch, digest, started)
    }

    /// Bypass every layer on read, then write the fresh result back
    async fn map_refreshed(
        &self,
        provider: &ProviderId,
        direction: Direction,
        symbols: &[String],
        digest: BatchDigest,
        started: Instant,
    ) -> BatchMappingResult {
        let epoch = self.layers.epoch(provider);
        let (batch, loaded) = self.resolve_uncached(provider, direction, symbols).await;

        if let Some((rules, resolved)) = loaded {
            let market = rules.default_market().to_string();
            let l1_ttl = self.ttl_for(CacheTier::L1, &market);
            self.layers.install_rule_set(Arc::clone(&rules), epoch, l1_ttl);

            let mut markets: BTreeSet<String> = resolved.iter().map(|m| m.market.clone()).collect();
            markets.insert(market);
            let entries = resolved
                .into_iter()
                .map(|m| {
                    let ttl = self.ttl_for(CacheTier::L2, &m.market);
                    (m, ttl)
                })
                .collect();
            self.layers.store_symbols(provider, epoch, entries);

            let batch = Arc::new(batch.clone());
            if batch.is_cacheable() {
                self.layers
                    .store_batch(digest.clone(), batch, epoch, self.batch_ttl(&markets));
            }
        }

        let mut result = BatchMappingResult::new(&batch, digest, started);
        result.metadata.forced_refresh = true;
        result
    }

    fn session(&self, market: &str) -> MarketSession {
        self.sessions.current_session_state(market)
    }

    fn ttl_for(&self, tier: CacheTier, market: &str) -> Duration {
        self.ttl.compute_ttl(tier, self.session(market))
    }

    /// Shortest L3 lifetime across the markets a batch touched
    fn batch_ttl(&self, markets: &BTreeSet<String>) -> Duration {
        markets
            .iter()
            .map(|market| self.ttl_for(CacheTier::L3, market))
            .min()
            .unwrap_or_else(|| self.ttl.compute_ttl(CacheTier::L3, MarketSession::Open))
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Cascade-invalidate one provider across L1, L2 and L3
    pub async fn invalidate_provider(&self, provider: &ProviderId) -> InvalidationReport {
        let report = self.layers.invalidate_provider(provider);
        self.metrics.record_invalidation();
        self.publish(CacheEvent::provider_invalidated(
            provider,
            None,
            usize::from(report.rules_removed),
            report.symbols_removed,
            report.batches_removed,
        ))
        .await;
        report
    }

    /// Drop TTL-expired entries in every layer
    pub fn purge_expired(&self) -> LayerCounts {
        self.layers.purge_expired()
    }

    async fn publish(&self, event: CacheEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, "Failed to publish cache event");
        }
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Spawn the change feed watcher and the memory monitor
    pub fn start_background(
        &self,
        feed: Option<Arc<dyn ChangeFeed>>,
        probe: Option<Arc<dyn MemoryProbe>>,
    ) -> Result<()> {
        let mut background = self.background.lock();
        if background.cancel.is_some() {
            return Err(Error::Internal("background tasks already running".into()));
        }
        let cancel = CancellationToken::new();

        if let Some(feed) = feed {
            let watcher = Arc::new(ChangeFeedWatcher::new(
                feed,
                Arc::clone(&self.layers) as Arc<dyn ProviderInvalidator>,
                Arc::clone(&self.publisher),
                Arc::clone(&self.metrics),
                self.config.feed.clone(),
            ));
            info!(
                staleness_bound_ms = watcher.staleness_bound().as_millis() as u64,
                "Starting change feed watcher"
            );
            background
                .handles
                .push(tokio::spawn(Arc::clone(&watcher).run(cancel.child_token())));
            background.watcher = Some(watcher);
        }

        if let Some(probe) = probe {
            let monitor = Arc::new(MemoryWatermarkMonitor::new(
                probe,
                Arc::clone(&self.layers) as Arc<dyn LayerControl>,
                Arc::clone(&self.publisher),
                Arc::clone(&self.metrics),
                self.config.memory.clone(),
            ));
            background
                .handles
                .push(tokio::spawn(Arc::clone(&monitor).run(cancel.child_token())));
            background.monitor = Some(monitor);
        }

        background.cancel = Some(cancel);
        Ok(())
    }

    /// Stop the background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        let (cancel, handles) = {
            let mut background = self.background.lock();
            (background.cancel.take(), std::mem::take(&mut background.handles))
        };
        self.health.set_ready(false);

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Symbol mapping cache stopped");
    }

    pub fn watcher(&self) -> Option<Arc<ChangeFeedWatcher>> {
        self.background.lock().watcher.clone()
    }

    pub fn monitor(&self) -> Option<Arc<MemoryWatermarkMonitor>> {
        self.background.lock().monitor.clone()
    }

    /// Longest a rule change can go unnoticed while the feed recovers;
    /// `None` without a feed, when entries only expire by TTL
    pub fn staleness_bound(&self) -> Option<Duration> {
        self.watcher().map(|w| w.staleness_bound())
    }

    pub fn health_check(&self) -> &HealthCheck {
        &self.health
    }

    pub fn health(&self) -> HealthResponse {
        self.health.evaluate(ComponentHealth {
            cache_enabled: self.config.enabled,
            feed_state: self.watcher().map(|w| w.state()),
            memory_level: self.monitor().map(|m| m.level()),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
