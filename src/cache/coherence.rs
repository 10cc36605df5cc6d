//! Provider Coherence
//!
//! Each provider has an epoch that moves forward on every invalidation and
//! a record of the rule-set version currently installed in L1.
//!
//! - Invalidation holds the provider's gate exclusively while it bumps the
//!   epoch and clears the layers.
//! - Inserts hold the gate shared and are dropped if the epoch they were
//!   computed under is no longer current.
//! - Reads of derived entries reject any entry whose epoch or version does
//!   not match.
//!
//! Together these keep a result computed before an invalidation from being
//! stored or served after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::entry::CachedEntry;
use crate::domain::{ProviderId, RuleVersion};

/// What a reader expects derived entries of one provider to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub epoch: u64,
    /// Version installed in L1, if any
    pub version: Option<RuleVersion>,
}

impl Freshness {
    /// Entry was produced under the current epoch and does not contradict
    /// the installed rule set
    pub fn admits<V>(&self, entry: &CachedEntry<V>) -> bool {
        entry.epoch() == self.epoch && self.version.map_or(true, |v| v == entry.version())
    }
}

#[derive(Debug, Default)]
struct ProviderCoherence {
    gate: RwLock<()>,
    epoch: AtomicU64,
    version: RwLock<Option<RuleVersion>>,
}

/// Epoch and version bookkeeping for every provider seen so far
#[derive(Debug, Default)]
pub struct CoherenceRegistry {
    providers: DashMap<ProviderId, Arc<ProviderCoherence>>,
}

impl CoherenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, provider: &ProviderId) -> Arc<ProviderCoherence> {
        if let Some(state) = self.providers.get(provider) {
            return Arc::clone(state.value());
        }
        Arc::clone(
            self.providers
                .entry(provider.clone())
                .or_insert_with(Default::default)
                .value(),
        )
    }

    /// Current epoch of a provider (0 before its first invalidation)
    pub fn epoch(&self, provider: &ProviderId) -> u64 {
        self.providers
            .get(provider)
            .map_or(0, |state| state.epoch.load(Ordering::Acquire))
    }

    /// Version currently installed in L1
    pub fn installed_version(&self, provider: &ProviderId) -> Option<RuleVersion> {
        self.providers
            .get(provider)
            .and_then(|state| *state.version.read())
    }

    pub fn freshness(&self, provider: &ProviderId) -> Freshness {
        match self.providers.get(provider) {
            Some(state) => Freshness {
                epoch: state.epoch.load(Ordering::Acquire),
                version: *state.version.read(),
            },
            None => Freshness {
                epoch: 0,
                version: None,
            },
        }
    }

    /// Run `store` while no invalidation of `provider` can start, but only
    /// if the epoch is still `expected_epoch`. Returns `None` when dropped.
    pub fn admit<R>(
        &self,
        provider: &ProviderId,
        expected_epoch: u64,
        store: impl FnOnce() -> R,
    ) -> Option<R> {
        let state = self.state(provider);
        let _shared = state.gate.read();
        if state.epoch.load(Ordering::Acquire) != expected_epoch {
            return None;
        }
        Some(store())
    }

    /// Like [`admit`](Self::admit), additionally recording `version` as the
    /// installed rule set
    pub fn admit_version<R>(
        &self,
        provider: &ProviderId,
        expected_epoch: u64,
        version: RuleVersion,
        store: impl FnOnce() -> R,
    ) -> Option<R> {
        let state = self.state(provider);
        let _shared = state.gate.read();
        if state.epoch.load(Ordering::Acquire) != expected_epoch {
            return None;
        }
        let result = store();
        *state.version.write() = Some(version);
        Some(result)
    }

    /// Forget the installed version without moving the epoch (L1 dropped
    /// under memory pressure)
    pub fn forget_version(&self, provider: &ProviderId) {
        if let Some(state) = self.providers.get(provider) {
            *state.version.write() = None;
        }
    }

    /// Forget every installed version
    pub fn forget_all_versions(&self) {
        for state in self.providers.iter() {
            *state.version.write() = None;
        }
    }

    /// Advance the epoch and run `clear` with inserts for `provider` blocked.
    /// Returns the new epoch alongside the result of `clear`.
    pub fn invalidate<R>(&self, provider: &ProviderId, clear: impl FnOnce() -> R) -> (u64, R) {
        let state = self.state(provider);
        let _exclusive = state.gate.write();
        let epoch = state.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        *state.version.write() = None;
        (epoch, clear())
    }

    /// Number of providers with coherence state
    pub fn tracked_providers(&self) -> usize {
        self.providers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn acme() -> ProviderId {
        ProviderId::from("acme")
    }

    #[test]
    fn test_invalidation_advances_epoch() {
        let registry = CoherenceRegistry::new();
        assert_eq!(registry.epoch(&acme()), 0);

        let (epoch, ()) = registry.invalidate(&acme(), || ());
        assert_eq!(epoch, 1);
        assert_eq!(registry.epoch(&acme()), 1);
        assert_eq!(registry.epoch(&ProviderId::from("beta")), 0);
    }

    #[test]
    fn test_stale_insert_is_dropped() {
        let registry = CoherenceRegistry::new();
        let epoch = registry.epoch(&acme());

        registry.invalidate(&acme(), || ());

        assert_eq!(registry.admit(&acme(), epoch, || "stored"), None);
        assert_eq!(
            registry.admit(&acme(), registry.epoch(&acme()), || "stored"),
            Some("stored")
        );
    }

    #[test]
    fn test_version_tracking() {
        let registry = CoherenceRegistry::new();
        registry.admit_version(&acme(), 0, RuleVersion(3), || ());
        assert_eq!(registry.installed_version(&acme()), Some(RuleVersion(3)));

        registry.forget_version(&acme());
        assert_eq!(registry.installed_version(&acme()), None);

        registry.admit_version(&acme(), 0, RuleVersion(4), || ());
        registry.invalidate(&acme(), || ());
        assert_eq!(registry.installed_version(&acme()), None);

        // Stale version install is refused
        assert!(registry.admit_version(&acme(), 0, RuleVersion(5), || ()).is_none());
        assert_eq!(registry.installed_version(&acme()), None);
    }

    #[test]
    fn test_freshness_admits() {
        let fresh = Freshness {
            epoch: 2,
            version: Some(RuleVersion(7)),
        };
        let ttl = Duration::from_secs(60);

        assert!(fresh.admits(&CachedEntry::new((), RuleVersion(7), 2, ttl)));
        assert!(!fresh.admits(&CachedEntry::new((), RuleVersion(6), 2, ttl)));
        assert!(!fresh.admits(&CachedEntry::new((), RuleVersion(7), 1, ttl)));

        let no_rules = Freshness {
            epoch: 2,
            version: None,
        };
        assert!(no_rules.admits(&CachedEntry::new((), RuleVersion(6), 2, ttl)));
    }
}
