//! Domain Events
//!
//! Immutable records of things that happened inside the cache engine:
//! invalidations, change-feed state transitions, memory cleanups and rule
//! loads. Background tasks publish them through an [`EventPublisher`]
//! so the outcome of each step is observable without scraping logs.
//!
//! [`EventPublisher`]: super::ports::EventPublisher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ports::{ChangeOperation, ProviderId, RuleVersion};

/// Domain event representing a significant occurrence in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    // =========================================================================
    // Invalidation Events
    // =========================================================================
    /// A provider's entries were invalidated across all three layers.
    ProviderInvalidated {
        provider: String,
        operation: Option<String>,
        rules_removed: usize,
        symbols_removed: usize,
        batches_removed: usize,
        timestamp: DateTime<Utc>,
    },

    /// A rule set was loaded from the backing store into L1.
    RuleSetLoaded {
        provider: String,
        version: u64,
        rule_count: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Change Feed Events
    // =========================================================================
    /// The change-feed watcher moved between states.
    FeedStateChanged {
        from: String,
        to: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Memory Events
    // =========================================================================
    /// One layer was cleared by the memory monitor.
    LayerCleared {
        layer: String,
        entries_cleared: usize,
        elapsed_ms: u64,
        usage_after_percent: f64,
        timestamp: DateTime<Utc>,
    },

    /// Clearing every layer did not relieve memory pressure.
    CleanupFailed {
        usage_percent: f64,
        critical_percent: f64,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::ProviderInvalidated { .. } => "ProviderInvalidated",
            CacheEvent::RuleSetLoaded { .. } => "RuleSetLoaded",
            CacheEvent::FeedStateChanged { .. } => "FeedStateChanged",
            CacheEvent::LayerCleared { .. } => "LayerCleared",
            CacheEvent::CleanupFailed { .. } => "CleanupFailed",
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CacheEvent::ProviderInvalidated { timestamp, .. }
            | CacheEvent::RuleSetLoaded { timestamp, .. }
            | CacheEvent::FeedStateChanged { timestamp, .. }
            | CacheEvent::LayerCleared { timestamp, .. }
            | CacheEvent::CleanupFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Provider the event concerns, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            CacheEvent::ProviderInvalidated { provider, .. }
            | CacheEvent::RuleSetLoaded { provider, .. } => Some(provider),
            _ => None,
        }
    }

    // =========================================================================
    // Factory Methods
    // =========================================================================

    pub fn provider_invalidated(
        provider: &ProviderId,
        operation: Option<ChangeOperation>,
        rules_removed: usize,
        symbols_removed: usize,
        batches_removed: usize,
    ) -> Self {
        CacheEvent::ProviderInvalidated {
            provider: provider.to_string(),
            operation: operation.map(|op| op.to_string()),
            rules_removed,
            symbols_removed,
            batches_removed,
            timestamp: Utc::now(),
        }
    }

    pub fn rule_set_loaded(provider: &ProviderId, version: RuleVersion, rule_count: usize) -> Self {
        CacheEvent::RuleSetLoaded {
            provider: provider.to_string(),
            version: version.0,
            rule_count,
            timestamp: Utc::now(),
        }
    }

    pub fn feed_state_changed(from: impl ToString, to: impl ToString, attempt: u32) -> Self {
        CacheEvent::FeedStateChanged {
            from: from.to_string(),
            to: to.to_string(),
            attempt,
            timestamp: Utc::now(),
        }
    }

    pub fn layer_cleared(
        layer: impl ToString,
        entries_cleared: usize,
        elapsed: Duration,
        usage_after_percent: f64,
    ) -> Self {
        CacheEvent::LayerCleared {
            layer: layer.to_string(),
            entries_cleared,
            elapsed_ms: elapsed.as_millis() as u64,
            usage_after_percent,
            timestamp: Utc::now(),
        }
    }

    pub fn cleanup_failed(usage_percent: f64, critical_percent: f64) -> Self {
        CacheEvent::CleanupFailed {
            usage_percent,
            critical_percent,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_provider() {
        let event = CacheEvent::provider_invalidated(
            &ProviderId::from("acme"),
            Some(ChangeOperation::Update),
            1,
            10,
            2,
        );
        assert_eq!(event.event_type(), "ProviderInvalidated");
        assert_eq!(event.provider(), Some("acme"));

        let event = CacheEvent::feed_state_changed("connecting", "streaming", 0);
        assert_eq!(event.event_type(), "FeedStateChanged");
        assert_eq!(event.provider(), None);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = CacheEvent::layer_cleared("L3", 42, Duration::from_millis(7), 65.5);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"LayerCleared\""));
        assert!(json.contains("\"entries_cleared\":42"));
        assert!(json.contains("\"elapsed_ms\":7"));

        let back: CacheEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "LayerCleared");
    }
}
