//! Change Feed Watcher
//!
//! Long-running task that consumes the rule collection's change feed and
//! turns every change into a cascade invalidation of the affected provider.
//! Connection handling is driven by [`FeedStateMachine`]; the cache keeps
//! serving whatever it holds while the feed is down.
//!
//! # Staleness bound
//!
//! While disconnected, a rule change can go unnoticed for at most one
//! reconnect wait (capped delay plus jitter) plus one polling pass of the
//! feed. [`ChangeFeedWatcher::staleness_bound`] reports that figure.
//!
//! The bound holds from the first connection on: until an event arrives,
//! the resume position is the head the subscription opened at, so a
//! subscription that breaks before its first event still resumes without
//! losing the changes made in between.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backoff::{ChangeFeedConfig, FeedSignal, FeedStateMachine, Transition, WatcherState};
use crate::cache::{CacheMetrics, ProviderInvalidator};
use crate::domain::{
    CacheEvent, ChangeEvent, ChangeFeed, ChangeStream, EventPublisher, ResumeToken, Subscription,
};

/// Watcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    pub events_received: u64,
    pub connect_failures: u64,
    pub stream_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    connect_failures: AtomicU64,
    stream_failures: AtomicU64,
}

/// Change feed consumer
pub struct ChangeFeedWatcher {
    feed: Arc<dyn ChangeFeed>,
    invalidator: Arc<dyn ProviderInvalidator>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<CacheMetrics>,
    config: ChangeFeedConfig,
    state_tx: watch::Sender<WatcherState>,
    resume: Mutex<Option<ResumeToken>>,
    counters: Counters,
}

impl ChangeFeedWatcher {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        invalidator: Arc<dyn ProviderInvalidator>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<CacheMetrics>,
        config: ChangeFeedConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(WatcherState::Disconnected);
        Self {
            feed,
            invalidator,
            publisher,
            metrics,
            config,
            state_tx,
            resume: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state_tx.subscribe()
    }

    /// Last resume token seen on the feed
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.resume.lock().clone()
    }

    /// Worst-case delay between a rule change and its invalidation while the
    /// feed is recovering
    pub fn staleness_bound(&self) -> Duration {
        self.config.worst_case_delay() + self.feed.poll_interval()
    }

    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            events_received: self.counters.events_received.load(Ordering::Relaxed),
            connect_failures: self.counters.connect_failures.load(Ordering::Relaxed),
            stream_failures: self.counters.stream_failures.load(Ordering::Relaxed),
        }
    }

    /// Run until `cancel` fires
    #[instrument(skip_all, name = "change_feed_watcher")]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            base_delay_ms = self.config.base_delay.as_millis() as u64,
            max_delay_ms = self.config.max_delay.as_millis() as u64,
            "Change feed watcher starting"
        );

        let mut machine = FeedStateMachine::new(self.config.clone());
        let mut stream: Option<ChangeStream> = None;
        let mut wait = Duration::ZERO;
        self.step(&mut machine, FeedSignal::Start).await;

        loop {
            match machine.state() {
                WatcherState::Connecting => {
                    let resume = self.resume_token();
                    let subscribed = tokio::select! {
                        _ = cancel.cancelled() => break,
                        subscribed = self.feed.subscribe(resume.clone()) => subscribed,
                    };
                    match subscribed {
                        Ok(subscription) => {
                            stream = Some(self.attach(subscription, resume));
                            self.step(&mut machine, FeedSignal::Connected).await;
                        }
                        Err(e) => {
                            self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, attempt = machine.attempt(), "Change feed connect failed");
                            wait = self.step(&mut machine, FeedSignal::ConnectFailed).await;
                        }
                    }
                }
                WatcherState::Streaming => {
                    let Some(active) = stream.as_mut() else {
                        wait = self.step(&mut machine, FeedSignal::StreamEnded).await;
                        continue;
                    };
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = active.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            self.handle_event(event).await;
                            self.step(&mut machine, FeedSignal::EventReceived).await;
                        }
                        Some(Err(e)) => {
                            self.counters.stream_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, "Change feed stream failed");
                            stream = None;
                            wait = self.step(&mut machine, FeedSignal::StreamError).await;
                        }
                        None => {
                            self.counters.stream_failures.fetch_add(1, Ordering::Relaxed);
                            warn!("Change feed stream ended");
                            stream = None;
                            wait = self.step(&mut machine, FeedSignal::StreamEnded).await;
                        }
                    }
                }
                WatcherState::ReconnectWait => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    self.step(&mut machine, FeedSignal::RetryElapsed).await;
                }
                WatcherState::Disconnected => break,
            }
        }

        drop(stream);
        self.step(&mut machine, FeedSignal::Stop).await;
        info!("Change feed watcher stopped");
    }

    /// Take over a fresh subscription. Its head becomes the resume position
    /// unless an event already supplied one.
    fn attach(&self, subscription: Subscription, resume: Option<ResumeToken>) -> ChangeStream {
        let Subscription { head, events } = subscription;
        debug!(resume = ?resume, head = ?head, "Subscribed to change feed");
        if let Some(head) = head {
            self.resume.lock().get_or_insert(head);
        }
        events
    }

    /// Apply a signal, publish the new state, and return the jittered wait
    /// when entering `ReconnectWait`
    async fn step(&self, machine: &mut FeedStateMachine, signal: FeedSignal) -> Duration {
        let transition = machine.apply(signal);
        if transition.changed() {
            self.announce(&transition).await;
        }
        transition
            .wait
            .map(|delay| self.config.jittered(delay))
            .unwrap_or_default()
    }

    async fn announce(&self, transition: &Transition) {
        self.state_tx.send_replace(transition.to);
        match transition.to {
            WatcherState::ReconnectWait => warn!(
                from = %transition.from,
                attempt = transition.attempt,
                "Change feed disconnected, serving cached entries until reconnect"
            ),
            _ => debug!(from = %transition.from, to = %transition.to, "Change feed state changed"),
        }
        let event =
            CacheEvent::feed_state_changed(transition.from, transition.to, transition.attempt);
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, "Failed to publish feed state event");
        }
    }

    async fn handle_event(&self, event: ChangeEvent) {
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);

        let report = self.invalidator.invalidate_provider(&event.provider);
        self.metrics.record_invalidation();

        if let Some(token) = event.resume_token {
            *self.resume.lock() = Some(token);
        }

        let published = self
            .publisher
            .publish(CacheEvent::provider_invalidated(
                &event.provider,
                Some(event.operation),
                usize::from(report.rules_removed),
                report.symbols_removed,
                report.batches_removed,
            ))
            .await;
        if let Err(e) = published {
            warn!(error = %e, "Failed to publish invalidation event");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryEventCollector;
    use crate::cache::InvalidationReport;
    use crate::domain::{ChangeOperation, ProviderId};
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Feed that plays back scripted subscriptions, then idles
    #[derive(Default)]
    struct ScriptedFeed {
        script: Mutex<VecDeque<Result<Vec<Result<ChangeEvent>>>>>,
        /// Head handed out with each successful subscription
        heads: Mutex<VecDeque<ResumeToken>>,
        resumes: Mutex<Vec<Option<ResumeToken>>>,
    }

    impl ScriptedFeed {
        fn new(script: Vec<Result<Vec<Result<ChangeEvent>>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                heads: Mutex::new(VecDeque::new()),
                resumes: Mutex::new(Vec::new()),
            }
        }

        fn with_heads(self, heads: &[&str]) -> Self {
            *self.heads.lock() = heads.iter().map(|h| ResumeToken(h.to_string())).collect();
            self
        }
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn subscribe(&self, resume: Option<ResumeToken>) -> Result<Subscription> {
            self.resumes.lock().push(resume);
            let events = match self.script.lock().pop_front() {
                // Scripted items, then the stream ends
                Some(Ok(items)) => futures::stream::iter(items).boxed(),
                Some(Err(e)) => return Err(e),
                None => futures::stream::pending().boxed(),
            };
            Ok(Subscription::new(self.heads.lock().pop_front(), events))
        }
    }

    #[derive(Default)]
    struct RecordingInvalidator {
        calls: Mutex<Vec<ProviderId>>,
    }

    impl ProviderInvalidator for RecordingInvalidator {
        fn invalidate_provider(&self, provider: &ProviderId) -> InvalidationReport {
            self.calls.lock().push(provider.clone());
            InvalidationReport {
                provider: provider.clone(),
                epoch: 1,
                rules_removed: true,
                symbols_removed: 0,
                batches_removed: 0,
            }
        }
    }

    fn fast_config() -> ChangeFeedConfig {
        ChangeFeedConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_ratio: 0.0,
        }
    }

    struct Harness {
        watcher: Arc<ChangeFeedWatcher>,
        feed: Arc<ScriptedFeed>,
        invalidator: Arc<RecordingInvalidator>,
        events: Arc<InMemoryEventCollector>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(script: Vec<Result<Vec<Result<ChangeEvent>>>>) -> Harness {
        start_with(ScriptedFeed::new(script))
    }

    fn start_with(feed: ScriptedFeed) -> Harness {
        let feed = Arc::new(feed);
        let invalidator = Arc::new(RecordingInvalidator::default());
        let events = Arc::new(InMemoryEventCollector::new());
        let watcher = Arc::new(ChangeFeedWatcher::new(
            feed.clone(),
            invalidator.clone(),
            events.clone(),
            Arc::new(CacheMetrics::new()),
            fast_config(),
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&watcher).run(cancel.clone()));
        Harness {
            watcher,
            feed,
            invalidator,
            events,
            cancel,
            handle,
        }
    }

    async fn wait_for_streaming(watcher: &ChangeFeedWatcher, min_subscribes: usize, feed: &ScriptedFeed) {
        for _ in 0..200 {
            if watcher.state() == WatcherState::Streaming && feed.resumes.lock().len() >= min_subscribes {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watcher never reached streaming");
    }

    #[tokio::test]
    async fn test_events_invalidate_providers() {
        let h = start(vec![Ok(vec![
            Ok(ChangeEvent::new("acme", ChangeOperation::Update).with_resume_token("1")),
            Ok(ChangeEvent::new("beta", ChangeOperation::Delete).with_resume_token("2")),
        ])]);

        // First stream ends after two events; the second subscription idles
        wait_for_streaming(&h.watcher, 2, &h.feed).await;

        let calls = h.invalidator.calls.lock().clone();
        assert_eq!(calls, vec![ProviderId::from("acme"), ProviderId::from("beta")]);
        assert_eq!(h.watcher.resume_token(), Some(ResumeToken("2".into())));
        assert_eq!(h.events.events_of_type("ProviderInvalidated").len(), 2);

        // Resubscription carries the last token
        let resumes = h.feed.resumes.lock().clone();
        assert_eq!(resumes[0], None);
        assert_eq!(resumes[1], Some(ResumeToken("2".into())));

        h.cancel.cancel();
        h.handle.await.unwrap();
        assert_eq!(h.watcher.state(), WatcherState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_after_connect_failures() {
        let h = start(vec![
            Err(Error::unavailable("refused")),
            Err(Error::unavailable("refused")),
        ]);

        wait_for_streaming(&h.watcher, 3, &h.feed).await;

        let stats = h.watcher.stats();
        assert_eq!(stats.connect_failures, 2);
        let states: Vec<String> = h
            .events
            .events_of_type("FeedStateChanged")
            .into_iter()
            .filter_map(|e| match e {
                CacheEvent::FeedStateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                "CONNECTING",
                "RECONNECT_WAIT",
                "CONNECTING",
                "RECONNECT_WAIT",
                "CONNECTING",
                "STREAMING"
            ]
        );

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_error_triggers_reconnect() {
        let h = start(vec![Ok(vec![
            Ok(ChangeEvent::new("acme", ChangeOperation::Insert).with_resume_token("7")),
            Err(Error::unavailable("cursor killed")),
        ])]);

        wait_for_streaming(&h.watcher, 2, &h.feed).await;
        assert_eq!(h.watcher.stats().stream_failures, 1);
        assert_eq!(
            h.feed.resumes.lock().last().cloned().flatten(),
            Some(ResumeToken("7".into()))
        );

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_break_before_first_event_resumes_from_head() {
        // First stream breaks at once, the second idles
        let feed = ScriptedFeed::new(vec![Ok(vec![Err(Error::unavailable("reset"))])])
            .with_heads(&["41", "42"]);
        let h = start_with(feed);

        wait_for_streaming(&h.watcher, 2, &h.feed).await;

        let resumes = h.feed.resumes.lock().clone();
        assert_eq!(resumes[0], None);
        assert_eq!(resumes[1], Some(ResumeToken("41".into())));
        // A held position is not overwritten by a later head
        assert_eq!(h.watcher.resume_token(), Some(ResumeToken("41".into())));
        assert!(h.invalidator.calls.lock().is_empty());

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_state_channel_and_staleness_bound() {
        let h = start(vec![]);
        let mut rx = h.watcher.subscribe_state();
        wait_for_streaming(&h.watcher, 1, &h.feed).await;
        assert_eq!(*rx.borrow_and_update(), WatcherState::Streaming);
        assert_eq!(h.watcher.staleness_bound(), Duration::from_millis(20));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }
}
