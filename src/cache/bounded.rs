//! Bounded LRU Store
//!
//! Storage shared by the three layers: a capacity-bounded LRU map plus a
//! secondary index from provider to keys, so provider invalidation touches
//! only the affected entries instead of scanning the layer.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use super::entry::CachedEntry;
use crate::domain::ProviderId;

struct Slot<V> {
    provider: ProviderId,
    entry: CachedEntry<V>,
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, Slot<V>>,
    by_provider: HashMap<ProviderId, HashSet<K>>,
}

impl<K: Hash + Eq + Clone, V> Inner<K, V> {
    fn unlink(&mut self, provider: &ProviderId, key: &K) {
        if let Some(keys) = self.by_provider.get_mut(provider) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_provider.remove(provider);
            }
        }
    }

    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.entries.pop(key)?;
        self.unlink(&slot.provider, key);
        Some(slot)
    }
}

/// Per-layer counters
#[derive(Debug, Default)]
struct LayerStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    rejected: AtomicU64,
    invalidated: AtomicU64,
}

/// Point-in-time layer statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerStatsSnapshot {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries pushed out by the LRU bound
    pub evictions: u64,
    /// Entries dropped on read or purge because their TTL elapsed
    pub expirations: u64,
    /// Entries dropped on read because their provider moved on
    pub rejected: u64,
    /// Entries removed by provider invalidation
    pub invalidated: u64,
}

impl LayerStatsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Capacity-bounded LRU map with a provider index
pub struct BoundedLru<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: NonZeroUsize,
    stats: LayerStats,
}

impl<K, V> BoundedLru<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a store holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                by_provider: HashMap::new(),
            }),
            capacity,
            stats: LayerStats::default(),
        }
    }

    /// Look up a live entry.
    ///
    /// Expired entries and entries `admit` refuses are removed and reported
    /// as a miss.
    pub fn get_if<F>(&self, key: &K, admit: F) -> Option<CachedEntry<V>>
    where
        F: FnOnce(&CachedEntry<V>) -> bool,
    {
        let mut inner = self.inner.lock();
        let verdict = inner.entries.get(key).map(|slot| {
            if slot.entry.is_expired() {
                Err(&self.stats.expirations)
            } else if !admit(&slot.entry) {
                Err(&self.stats.rejected)
            } else {
                Ok(slot.entry.clone())
            }
        });

        match verdict {
            Some(Ok(entry)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(Err(counter)) => {
                inner.remove(key);
                counter.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Look up a live entry without an admission check
    pub fn get(&self, key: &K) -> Option<CachedEntry<V>> {
        self.get_if(key, |_| true)
    }

    /// Check presence without touching recency or counters
    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .lock()
            .entries
            .peek(key)
            .map_or(false, |slot| !slot.entry.is_expired())
    }

    /// Insert or replace an entry owned by `provider`
    pub fn insert(&self, provider: ProviderId, key: K, entry: CachedEntry<V>) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, provider, key, entry);
    }

    /// Insert several entries under one lock acquisition
    pub fn insert_many<I>(&self, items: I)
    where
        I: IntoIterator<Item = (ProviderId, K, CachedEntry<V>)>,
    {
        let mut inner = self.inner.lock();
        for (provider, key, entry) in items {
            self.insert_locked(&mut inner, provider, key, entry);
        }
    }

    fn insert_locked(
        &self,
        inner: &mut Inner<K, V>,
        provider: ProviderId,
        key: K,
        entry: CachedEntry<V>,
    ) {
        let previous = inner.entries.peek(&key).map(|slot| slot.provider.clone());
        if let Some(previous) = previous {
            inner.unlink(&previous, &key);
        }
        inner
            .by_provider
            .entry(provider.clone())
            .or_default()
            .insert(key.clone());

        if let Some((evicted_key, evicted)) = inner.entries.push(key.clone(), Slot { provider, entry })
        {
            if evicted_key != key {
                inner.unlink(&evicted.provider, &evicted_key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove a single entry
    pub fn remove(&self, key: &K) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Remove every entry owned by `provider`; returns how many were removed
    pub fn invalidate_provider(&self, provider: &ProviderId) -> usize {
        let mut inner = self.inner.lock();
        let Some(keys) = inner.by_provider.remove(provider) else {
            return 0;
        };
        let removed = keys
            .iter()
            .filter(|key| inner.entries.pop(*key).is_some())
            .count();
        self.stats
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop everything; returns how many entries were held
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.by_provider.clear();
        count
    }

    /// Remove entries whose TTL has elapsed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        self.stats
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Number of entries currently held for `provider`
    pub fn provider_len(&self, provider: &ProviderId) -> usize {
        self.inner
            .lock()
            .by_provider
            .get(provider)
            .map_or(0, HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn stats(&self) -> LayerStatsSnapshot {
        LayerStatsSnapshot {
            entries: self.len(),
            capacity: self.capacity(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            invalidated: self.stats.invalidated.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
