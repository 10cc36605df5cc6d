//! In-Memory Rule Store Adapter
//!
//! Implements both `RuleStore` and `ChangeFeed` over a `DashMap`, with fault
//! injection hooks for exercising the engine's failure paths.
//!
//! Every write is appended to a replay log under a sequence number; the
//! sequence number is the resume token, so a resubscription replays exactly
//! what it missed. The log keeps the most recent `REPLAY_CAPACITY` events;
//! a token older than that replays everything still retained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::{
    ChangeEvent, ChangeFeed, ChangeOperation, MappingRule, MappingRuleSet, ProviderId,
    ResumeToken, RuleStore, RuleVersion, Subscription,
};
use crate::error::{Error, Result};

const FEED_CAPACITY: usize = 1024;

/// Events kept for resumed subscriptions
pub const REPLAY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
enum FeedItem {
    Event(ChangeEvent),
    Break(String),
}

/// Most recent change events, numbered from 1
#[derive(Debug)]
struct ReplayLog {
    events: VecDeque<ChangeEvent>,
    last_sequence: u64,
    capacity: usize,
}

impl ReplayLog {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            last_sequence: 0,
            capacity: capacity.max(1),
        }
    }

    fn append(&mut self, provider: ProviderId, operation: ChangeOperation) -> ChangeEvent {
        self.last_sequence += 1;
        let event = ChangeEvent::new(provider, operation)
            .with_resume_token(self.last_sequence.to_string());
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        event
    }

    fn head(&self) -> ResumeToken {
        ResumeToken(self.last_sequence.to_string())
    }

    /// Sequence number just before the oldest retained event
    fn floor(&self) -> u64 {
        self.last_sequence - self.events.len() as u64
    }

    /// Retained events numbered after `sequence`
    fn after(&self, sequence: u64) -> VecDeque<ChangeEvent> {
        let skip = sequence.saturating_sub(self.floor()).min(self.events.len() as u64) as usize;
        self.events.iter().skip(skip).cloned().collect()
    }
}

/// In-memory rule store with a resumable change feed
pub struct InMemoryRuleStore {
    rule_sets: DashMap<ProviderId, MappingRuleSet>,
    next_version: AtomicU64,
    log: Mutex<ReplayLog>,
    feed: broadcast::Sender<FeedItem>,
    loads: DashMap<ProviderId, u64>,
    total_loads: AtomicU64,
    load_latency: Mutex<Duration>,
    unavailable: DashSet<ProviderId>,
    all_unavailable: AtomicBool,
    failing_subscribes: AtomicU32,
    subscriptions: AtomicU64,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::with_replay_capacity(REPLAY_CAPACITY)
    }

    /// Store whose replay log keeps only the last `capacity` events
    pub fn with_replay_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            rule_sets: DashMap::new(),
            next_version: AtomicU64::new(0),
            log: Mutex::new(ReplayLog::new(capacity)),
            feed,
            loads: DashMap::new(),
            total_loads: AtomicU64::new(0),
            load_latency: Mutex::new(Duration::ZERO),
            unavailable: DashSet::new(),
            all_unavailable: AtomicBool::new(false),
            failing_subscribes: AtomicU32::new(0),
            subscriptions: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Replace a provider's rules; returns the new version
    pub fn upsert(
        &self,
        provider: impl Into<ProviderId>,
        market: impl Into<String>,
        rules: Vec<MappingRule>,
    ) -> RuleVersion {
        let provider = provider.into();
        let version = RuleVersion(self.next_version.fetch_add(1, Ordering::AcqRel) + 1);
        self.upsert_rule_set(MappingRuleSet::new(provider, version, market, rules));
        version
    }

    /// Store a rule set exactly as given
    pub fn upsert_rule_set(&self, rule_set: MappingRuleSet) {
        self.next_version
            .fetch_max(rule_set.version.0, Ordering::AcqRel);
        let provider = rule_set.provider.clone();
        let operation = match self.rule_sets.insert(provider.clone(), rule_set) {
            Some(_) => ChangeOperation::Update,
            None => ChangeOperation::Insert,
        };
        self.emit(provider, operation);
    }

    /// Delete a provider's rules
    pub fn remove(&self, provider: &ProviderId) -> bool {
        let removed = self.rule_sets.remove(provider).is_some();
        if removed {
            self.emit(provider.clone(), ChangeOperation::Delete);
        }
        removed
    }

    pub fn current_version(&self, provider: &ProviderId) -> Option<RuleVersion> {
        self.rule_sets.get(provider).map(|set| set.version)
    }

    fn emit(&self, provider: ProviderId, operation: ChangeOperation) {
        let mut log = self.log.lock();
        let event = log.append(provider, operation);
        // No subscribers is fine; the log keeps the event for replay
        let _ = self.feed.send(FeedItem::Event(event));
    }

    // =========================================================================
    // Test Hooks
    // =========================================================================

    /// Loads attempted for one provider
    pub fn load_count(&self, provider: &ProviderId) -> u64 {
        self.loads.get(provider).map_or(0, |n| *n)
    }

    /// Loads attempted for all providers
    pub fn total_loads(&self) -> u64 {
        self.total_loads.load(Ordering::Acquire)
    }

    /// Delay every load by `latency`
    pub fn set_load_latency(&self, latency: Duration) {
        *self.load_latency.lock() = latency;
    }

    /// Make loads of one provider fail as unreachable
    pub fn set_unavailable(&self, provider: &ProviderId, unavailable: bool) {
        if unavailable {
            self.unavailable.insert(provider.clone());
        } else {
            self.unavailable.remove(provider);
        }
    }

    /// Make every load and subscription fail as unreachable
    pub fn set_all_unavailable(&self, unavailable: bool) {
        self.all_unavailable.store(unavailable, Ordering::Release);
    }

    /// Reject the next `count` subscription attempts
    pub fn fail_next_subscribes(&self, count: u32) {
        self.failing_subscribes.store(count, Ordering::Release);
    }

    /// Break every open subscription with an error
    pub fn inject_feed_error(&self, reason: impl Into<String>) {
        let _ = self.feed.send(FeedItem::Break(reason.into()));
    }

    /// Successful subscriptions so far
    pub fn subscription_count(&self) -> u64 {
        self.subscriptions.load(Ordering::Acquire)
    }

    fn take_subscribe_failure(&self) -> bool {
        self.failing_subscribes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn load_rule_set(&self, provider: &ProviderId) -> Result<MappingRuleSet> {
        self.total_loads.fetch_add(1, Ordering::AcqRel);
        *self.loads.entry(provider.clone()).or_insert(0) += 1;

        let latency = *self.load_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.all_unavailable.load(Ordering::Acquire) || self.unavailable.contains(provider) {
            return Err(Error::unavailable(format!(
                "rule store unreachable for provider '{}'",
                provider
            )));
        }

        let mut rule_set = self
            .rule_sets
            .get(provider)
            .map(|set| set.clone())
            .ok_or_else(|| Error::ProviderNotFound(provider.to_string()))?;
        rule_set.loaded_at = Utc::now();
        Ok(rule_set)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryRuleStore {
    async fn subscribe(&self, resume: Option<ResumeToken>) -> Result<Subscription> {
        if self.all_unavailable.load(Ordering::Acquire) || self.take_subscribe_failure() {
            return Err(Error::unavailable("change feed unreachable"));
        }

        // Replay and live subscription are taken under the log lock so no
        // event falls between them
        let (replay, head, receiver) = {
            let log = self.log.lock();
            let after = match resume.as_ref().map(|t| t.0.parse::<u64>()) {
                Some(Ok(sequence)) => {
                    if sequence < log.floor() {
                        warn!(
                            token = sequence,
                            oldest_retained = log.floor() + 1,
                            "Resume token older than the replay log, replaying all retained events"
                        );
                    }
                    sequence
                }
                Some(Err(_)) => {
                    warn!(token = ?resume, "Unknown resume token, replaying the whole log");
                    0
                }
                None => log.last_sequence,
            };
            (log.after(after), log.head(), self.feed.subscribe())
        };
        self.subscriptions.fetch_add(1, Ordering::AcqRel);
        debug!(replayed = replay.len(), head = %head, "Change feed subscribed");

        let stream = stream::unfold(
            (replay, receiver, false),
            |(mut replay, mut receiver, broken)| async move {
                if broken {
                    return None;
                }
                if let Some(event) = replay.pop_front() {
                    return Some((Ok(event), (replay, receiver, false)));
                }
                match receiver.recv().await {
                    Ok(FeedItem::Event(event)) => Some((Ok(event), (replay, receiver, false))),
                    Ok(FeedItem::Break(reason)) => {
                        Some((Err(Error::unavailable(reason)), (replay, receiver, true)))
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                        Err(Error::unavailable(format!(
                            "change feed lagged by {} events",
                            skipped
                        ))),
                        (replay, receiver, true),
                    )),
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            },
        );
        Ok(Subscription::new(Some(head), Box::pin(stream)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::StreamExt;

    fn acme() -> ProviderId {
        ProviderId::from("acme")
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let store = InMemoryRuleStore::new();
        let v1 = store.upsert("acme", "US", vec![MappingRule::exact("AAA", "AAA.US")]);
        let v2 = store.upsert("acme", "US", vec![MappingRule::exact("AAA", "AAA.NASDAQ")]);
        assert!(v2 > v1);

        let set = store.load_rule_set(&acme()).await.unwrap();
        assert_eq!(set.version, v2);
        assert_eq!(set.rules[0].target, "AAA.NASDAQ");
        assert_eq!(store.load_count(&acme()), 1);
    }

    #[tokio::test]
    async fn test_missing_and_unavailable() {
        let store = InMemoryRuleStore::new();
        assert_matches!(
            store.load_rule_set(&acme()).await,
            Err(Error::ProviderNotFound(_))
        );

        store.upsert("acme", "US", vec![]);
        store.set_unavailable(&acme(), true);
        assert_matches!(
            store.load_rule_set(&acme()).await,
            Err(Error::BackingStoreUnavailable { .. })
        );
        store.set_unavailable(&acme(), false);
        assert!(store.load_rule_set(&acme()).await.is_ok());
        assert_eq!(store.total_loads(), 3);
    }

    #[tokio::test]
    async fn test_feed_delivers_live_events() {
        let store = InMemoryRuleStore::new();
        let mut stream = store.subscribe(None).await.unwrap().events;

        store.upsert("acme", "US", vec![]);
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.provider, acme());
        assert_eq!(event.operation, ChangeOperation::Insert);
        assert_eq!(event.resume_token, Some(ResumeToken("1".into())));
    }

    #[tokio::test]
    async fn test_resume_replays_missed_events() {
        let store = InMemoryRuleStore::new();
        store.upsert("acme", "US", vec![]);
        store.upsert("beta", "US", vec![]);
        store.remove(&acme());

        let mut stream = store
            .subscribe(Some(ResumeToken("1".into())))
            .await
            .unwrap()
            .events;
        let second = stream.next().await.unwrap().unwrap();
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(second.provider, ProviderId::from("beta"));
        assert_eq!(third.operation, ChangeOperation::Delete);
    }

    #[tokio::test]
    async fn test_injected_error_breaks_stream() {
        let store = InMemoryRuleStore::new();
        let mut stream = store.subscribe(None).await.unwrap().events;

        store.inject_feed_error("connection reset");
        assert_matches!(
            stream.next().await,
            Some(Err(Error::BackingStoreUnavailable { .. }))
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_failures() {
        let store = InMemoryRuleStore::new();
        store.fail_next_subscribes(2);
        assert!(store.subscribe(None).await.is_err());
        assert!(store.subscribe(None).await.is_err());
        assert!(store.subscribe(None).await.is_ok());
        assert_eq!(store.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_head_resumes_changes_made_after_subscribing() {
        let store = InMemoryRuleStore::new();
        store.upsert("acme", "US", vec![]);

        let subscription = store.subscribe(None).await.unwrap();
        assert_eq!(subscription.head, Some(ResumeToken("1".into())));
        drop(subscription);

        // Written while nobody is subscribed
        store.upsert("acme", "US", vec![MappingRule::exact("AAA", "AAA.NYSE")]);

        let mut stream = store
            .subscribe(Some(ResumeToken("1".into())))
            .await
            .unwrap()
            .events;
        let missed = stream.next().await.unwrap().unwrap();
        assert_eq!(missed.provider, acme());
        assert_eq!(missed.operation, ChangeOperation::Update);
        assert_eq!(missed.resume_token, Some(ResumeToken("2".into())));
    }

    #[tokio::test]
    async fn test_replay_log_is_capped() {
        let store = InMemoryRuleStore::with_replay_capacity(2);
        store.upsert("acme", "US", vec![]);
        store.upsert("beta", "US", vec![]);
        store.upsert("gamma", "US", vec![]);

        // Token older than the log: everything retained is replayed
        let mut stream = store
            .subscribe(Some(ResumeToken("0".into())))
            .await
            .unwrap()
            .events;
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.provider, ProviderId::from("beta"));
        assert_eq!(second.provider, ProviderId::from("gamma"));

        // Token inside the log replays only what followed it
        let mut stream = store
            .subscribe(Some(ResumeToken("2".into())))
            .await
            .unwrap()
            .events;
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.resume_token, Some(ResumeToken("3".into())));
    }
}
