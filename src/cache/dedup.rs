//! Query Deduplication
//!
//! Concurrent requests for the same key share one execution of the
//! underlying work. The first caller (the leader) registers a pending query
//! and spawns the work under a timeout; later callers subscribe to the same
//! broadcast and receive a clone of the outcome.
//!
//! The pending entry is removed before the outcome is broadcast, on success,
//! failure, timeout and panic alike, so a key is never left blocked.
//! The work runs on its own task: a caller that stops waiting does not
//! cancel it for the others.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default time a deduplicated query may run
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

struct PendingQuery<T> {
    id: u64,
    sender: broadcast::Sender<Result<T>>,
    started_at: Instant,
    cancelled: Arc<AtomicBool>,
}

type Registry<T> = Arc<Mutex<HashMap<String, PendingQuery<T>>>>;

/// Removes the pending entry exactly once, whichever way the work ends
struct PendingGuard<T> {
    registry: Registry<T>,
    key: String,
    id: u64,
    sender: broadcast::Sender<Result<T>>,
    done: bool,
}

impl<T> PendingGuard<T> {
    fn remove(&self) -> Option<PendingQuery<T>> {
        let mut registry = self.registry.lock();
        match registry.get(&self.key) {
            Some(pending) if pending.id == self.id => registry.remove(&self.key),
            _ => None,
        }
    }

    fn complete(mut self, outcome: Result<T>) {
        if let Some(pending) = self.remove() {
            debug!(
                key = %self.key,
                elapsed_ms = pending.started_at.elapsed().as_millis() as u64,
                cancelled = pending.cancelled.load(Ordering::Acquire),
                ok = outcome.is_ok(),
                "Deduplicated query finished"
            );
        }
        self.done = true;
        // No receivers left is fine: every caller stopped waiting
        let _ = self.sender.send(outcome);
    }
}

impl<T> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        if !self.done && self.remove().is_some() {
            warn!(key = %self.key, "Deduplicated query ended without an outcome");
        }
    }
}

/// Whether a caller ran the work or joined someone else's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRole {
    Leader,
    Follower,
}

#[derive(Debug, Default)]
struct DedupStats {
    leaders: AtomicU64,
    joined: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

/// Deduplicator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStatsSnapshot {
    /// Queries actually executed
    pub leaders: u64,
    /// Callers that joined an in-flight query
    pub joined: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub in_flight: usize,
}

/// Registry of in-flight queries keyed by string
pub struct QueryDeduplicator<T> {
    registry: Registry<T>,
    timeout: Duration,
    next_id: AtomicU64,
    stats: Arc<DedupStats>,
}

impl<T> QueryDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            next_id: AtomicU64::new(1),
            stats: Arc::new(DedupStats::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `work` unless an identical query is already in flight, in which
    /// case wait for that one instead
    pub async fn run_deduplicated<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.run_tracked(key, work).await.0
    }

    /// [`run_deduplicated`](Self::run_deduplicated), also reporting whether
    /// this caller led the query
    pub async fn run_tracked<F, Fut>(&self, key: &str, work: F) -> (Result<T>, QueryRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (mut receiver, role) = {
            let mut registry = self.registry.lock();
            match registry.get(key) {
                Some(pending) => {
                    self.stats.joined.fetch_add(1, Ordering::Relaxed);
                    (pending.sender.subscribe(), QueryRole::Follower)
                }
                None => {
                    let (sender, receiver) = broadcast::channel(1);
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let cancelled = Arc::new(AtomicBool::new(false));
                    registry.insert(
                        key.to_string(),
                        PendingQuery {
                            id,
                            sender: sender.clone(),
                            started_at: Instant::now(),
                            cancelled: Arc::clone(&cancelled),
                        },
                    );
                    drop(registry);

                    self.stats.leaders.fetch_add(1, Ordering::Relaxed);
                    let guard = PendingGuard {
                        registry: Arc::clone(&self.registry),
                        key: key.to_string(),
                        id,
                        sender,
                        done: false,
                    };
                    self.spawn(guard, cancelled, work());
                    (receiver, QueryRole::Leader)
                }
            }
        };

        let outcome = match receiver.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Internal(format!(
                "deduplicated query '{}' ended without an outcome",
                key
            ))),
        };
        (outcome, role)
    }

    fn spawn<Fut>(&self, guard: PendingGuard<T>, cancelled: Arc<AtomicBool>, work: Fut)
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let timeout = self.timeout;
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancelled.store(true, Ordering::Release);
                    stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %guard.key, timeout_ms = timeout.as_millis() as u64, "Deduplicated query timed out");
                    Err(Error::QueryTimeout {
                        key: guard.key.clone(),
                        timeout,
                    })
                }
            };
            if outcome.is_err() {
                stats.failures.fetch_add(1, Ordering::Relaxed);
            }
            guard.complete(outcome);
        });
    }

    /// Number of queries currently in flight
    pub fn in_flight(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.registry.lock().contains_key(key)
    }

    pub fn stats(&self) -> DedupStatsSnapshot {
        DedupStatsSnapshot {
            leaders: self.stats.leaders.load(Ordering::Relaxed),
            joined: self.stats.joined.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_single_caller() {
        let dedup = QueryDeduplicator::new(Duration::from_secs(1));
        let value = dedup
            .run_deduplicated("k", || async { Ok(42u32) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(dedup.in_flight(), 0);
        assert_eq!(dedup.stats().leaders, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let dedup = Arc::new(QueryDeduplicator::new(Duration::from_secs(5)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                dedup
                    .run_tracked("same", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("done".to_string())
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (outcome, role) = handle.await.unwrap();
            assert_eq!(outcome.unwrap(), "done");
            if role == QueryRole::Leader {
                leaders += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(dedup.stats().joined, 15);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_sticky() {
        let dedup = QueryDeduplicator::<u32>::new(Duration::from_secs(1));

        let result = dedup
            .run_deduplicated("k", || async { Err(Error::unavailable("down")) })
            .await;
        assert_matches!(result, Err(Error::BackingStoreUnavailable { .. }));
        assert!(!dedup.is_pending("k"));

        let result = dedup.run_deduplicated("k", || async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(dedup.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_timeout_rejects_all_waiters_and_frees_key() {
        let dedup = Arc::new(QueryDeduplicator::<u32>::new(Duration::from_millis(50)));

        let slow = || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(0)
        };
        let follower = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                dedup.run_deduplicated("slow", slow).await
            })
        };
        let leader = dedup.run_deduplicated("slow", slow).await;

        assert_matches!(leader, Err(Error::QueryTimeout { .. }));
        assert_matches!(follower.await.unwrap(), Err(Error::QueryTimeout { .. }));
        assert!(!dedup.is_pending("slow"));
        assert_eq!(dedup.stats().timeouts, 1);

        // Next caller starts a fresh attempt instead of hanging
        let retry = dedup.run_deduplicated("slow", || async { Ok(7) }).await;
        assert_eq!(retry.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_panicking_work_does_not_orphan_entry() {
        let dedup = QueryDeduplicator::<u32>::new(Duration::from_secs(1));

        let result = dedup
            .run_deduplicated("boom", || async {
                if true {
                    panic!("work panicked");
                }
                Ok(0)
            })
            .await;
        assert_matches!(result, Err(Error::Internal(_)));
        assert!(!dedup.is_pending("boom"));
    }

    #[tokio::test]
    async fn test_abandoned_leader_does_not_cancel_work() {
        let dedup = Arc::new(QueryDeduplicator::<u32>::new(Duration::from_secs(5)));
        let finished = Arc::new(AtomicBool::new(false));

        let leader = {
            let dedup = Arc::clone(&dedup);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                dedup
                    .run_deduplicated("k", move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let joined = dedup.run_deduplicated("k", || async { Ok(2) }).await;
        assert_eq!(joined.unwrap(), 1);
        assert!(finished.load(Ordering::SeqCst));
    }
}
