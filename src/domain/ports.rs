//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the value objects the cache engine works with and the
//! traits (ports) it depends on. Infrastructure adapters implement these
//! traits to provide concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  RuleStore │ ChangeFeed │ MarketSessionSource │ ...  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  InMemoryRuleStore │ YamlRuleStore │ ProcMemoryProbe │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::events::CacheEvent;
use crate::error::{Error, Result};

/// Longest provider identifier accepted.
pub const MAX_PROVIDER_ID_LEN: usize = 64;

// =============================================================================
// Value Objects
// =============================================================================

/// Provider identifier (value object).
///
/// Stable string key of an external data source; each provider owns exactly
/// one mapping rule set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject identifiers that are empty, too long, or contain anything but
    /// `[A-Za-z0-9_.-]`.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::MalformedRequest("provider id is empty".into()));
        }
        if self.0.len() > MAX_PROVIDER_ID_LEN {
            return Err(Error::MalformedRequest(format!(
                "provider id longer than {} characters",
                MAX_PROVIDER_ID_LEN
            )));
        }
        if self.0 == "." || self.0 == ".." {
            return Err(Error::MalformedRequest(format!(
                "provider id '{}' is reserved",
                self.0
            )));
        }
        if let Some(c) = self
            .0
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(Error::MalformedRequest(format!(
                "provider id '{}' contains invalid character {:?}",
                self.0, c
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Translation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Provider-native symbol to platform-standard symbol
    ToStandard,
    /// Platform-standard symbol to provider-native symbol
    FromStandard,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToStandard => "to_standard",
            Direction::FromStandard => "from_standard",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "to_standard" | "to" => Ok(Direction::ToStandard),
            "from_standard" | "from" => Ok(Direction::FromStandard),
            other => Err(Error::MalformedRequest(format!(
                "unknown direction '{}'",
                other
            ))),
        }
    }
}

/// Rule-set revision marker. Higher is newer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RuleVersion(pub u64);

impl std::fmt::Display for RuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Wildcard marker accepted in rule sources and targets.
pub const WILDCARD: char = '*';

/// One symbol translation rule.
///
/// `source` is in provider format and `target` in platform-standard format.
/// Either side may be an exact symbol or a pattern with a single `*`, e.g.
/// `{ source: "*", target: "*.US" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market: Option<String>,
}

impl MappingRule {
    pub fn exact(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            market: None,
        }
    }

    pub fn with_market(mut self, market: impl Into<String>) -> Self {
        self.market = Some(market.into());
        self
    }

    /// Whether either side is a wildcard pattern
    pub fn is_pattern(&self) -> bool {
        self.source.contains(WILDCARD)
    }
}

/// Complete rule set for one provider.
///
/// Immutable once loaded: a reload replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRuleSet {
    pub provider: ProviderId,
    pub version: RuleVersion,
    /// Default market for rules that do not carry their own tag
    pub market: String,
    pub rules: Vec<MappingRule>,
    #[serde(default = "Utc::now")]
    pub loaded_at: DateTime<Utc>,
}

impl MappingRuleSet {
    pub fn new(
        provider: impl Into<ProviderId>,
        version: RuleVersion,
        market: impl Into<String>,
        rules: Vec<MappingRule>,
    ) -> Self {
        Self {
            provider: provider.into(),
            version,
            market: market.into(),
            rules,
            loaded_at: Utc::now(),
        }
    }

    /// Check every rule is non-empty and reversible.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidRuleSet {
            provider: self.provider.to_string(),
            reason,
        };

        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.source.trim().is_empty() || rule.target.trim().is_empty() {
                return Err(invalid(format!("rule {} has an empty side", idx)));
            }
            let src = rule.source.matches(WILDCARD).count();
            let dst = rule.target.matches(WILDCARD).count();
            if src > 1 || dst > 1 {
                return Err(invalid(format!("rule {} has more than one wildcard", idx)));
            }
            if src != dst {
                return Err(invalid(format!(
                    "rule {} is not reversible: '{}' -> '{}'",
                    idx, rule.source, rule.target
                )));
            }
        }
        Ok(())
    }
}

/// Trading session state of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSession {
    Open,
    Pre,
    Post,
    Closed,
}

impl std::fmt::Display for MarketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketSession::Open => write!(f, "open"),
            MarketSession::Pre => write!(f, "pre"),
            MarketSession::Post => write!(f, "post"),
            MarketSession::Closed => write!(f, "closed"),
        }
    }
}

/// Kind of change observed on the rule collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOperation::Insert => write!(f, "insert"),
            ChangeOperation::Update => write!(f, "update"),
            ChangeOperation::Delete => write!(f, "delete"),
        }
    }
}

/// Opaque position in the change feed, used to resume after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub String);

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One change notification from the rule collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub provider: ProviderId,
    pub operation: ChangeOperation,
    pub resume_token: Option<ResumeToken>,
}

impl ChangeEvent {
    pub fn new(provider: impl Into<ProviderId>, operation: ChangeOperation) -> Self {
        Self {
            provider: provider.into(),
            operation,
            resume_token: None,
        }
    }

    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(ResumeToken(token.into()));
        self
    }
}

/// Raw process memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryReading {
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used_bytes,
            total_bytes,
        }
    }

    /// Usage as a percentage (0.0 - 100.0); 0 when the total is unknown
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

// =============================================================================
// Rule Store Port
// =============================================================================

/// Point-query port of the backing document store.
///
/// The engine only ever reads from it.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Load the current rule set of a provider.
    async fn load_rule_set(&self, provider: &ProviderId) -> Result<MappingRuleSet>;
}

// =============================================================================
// Change Feed Port
// =============================================================================

/// Stream of change notifications. An `Err` item means the subscription broke.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// An open change feed subscription
pub struct Subscription {
    /// Feed position at the moment the subscription opened. Resuming from
    /// it replays every change made after that moment, so a consumer that
    /// has seen no event yet can still reconnect without a gap.
    pub head: Option<ResumeToken>,
    pub events: ChangeStream,
}

impl Subscription {
    pub fn new(head: Option<ResumeToken>, events: ChangeStream) -> Self {
        Self { head, events }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Change-notification port of the backing document store.
///
/// Delivery is best-effort: a resumed subscription should replay events
/// after `resume`, but exactly-once is not required.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription, resuming after `resume` when given.
    async fn subscribe(&self, resume: Option<ResumeToken>) -> Result<Subscription>;

    /// How long a change may sit in the store before the feed notices it.
    /// Zero for push-based feeds.
    fn poll_interval(&self) -> Duration {
        Duration::ZERO
    }
}

// =============================================================================
// Market Session Port
// =============================================================================

/// Synchronous view of market session state.
pub trait MarketSessionSource: Send + Sync {
    fn current_session_state(&self, market: &str) -> MarketSession;
}

// =============================================================================
// Memory Probe Port
// =============================================================================

/// Process memory sampler.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Result<MemoryReading>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing cache domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: CacheEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_provider_id_validation() {
        assert!(ProviderId::from("acme").validate().is_ok());
        assert!(ProviderId::from("acme-eu_2.v1").validate().is_ok());

        assert_matches!(
            ProviderId::from("").validate(),
            Err(Error::MalformedRequest(_))
        );
        assert_matches!(
            ProviderId::from("../etc").validate(),
            Err(Error::MalformedRequest(_))
        );
        assert_matches!(
            ProviderId::from("..").validate(),
            Err(Error::MalformedRequest(_))
        );
        assert_matches!(
            ProviderId::from("a".repeat(65)).validate(),
            Err(Error::MalformedRequest(_))
        );
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("to-standard".parse::<Direction>().unwrap(), Direction::ToStandard);
        assert_eq!("FROM_STANDARD".parse::<Direction>().unwrap(), Direction::FromStandard);
        assert!("sideways".parse::<Direction>().is_err());
        assert_eq!(Direction::ToStandard.to_string(), "to_standard");
    }

    #[test]
    fn test_rule_set_validation() {
        let ok = MappingRuleSet::new(
            "acme",
            RuleVersion(1),
            "US",
            vec![MappingRule::exact("AAA", "AAA.US"), MappingRule::exact("*", "*.US")],
        );
        assert!(ok.validate().is_ok());

        let irreversible = MappingRuleSet::new(
            "acme",
            RuleVersion(1),
            "US",
            vec![MappingRule::exact("*", "ALL.US")],
        );
        assert_matches!(irreversible.validate(), Err(Error::InvalidRuleSet { .. }));

        let double = MappingRuleSet::new(
            "acme",
            RuleVersion(1),
            "US",
            vec![MappingRule::exact("*.*", "*.*")],
        );
        assert_matches!(double.validate(), Err(Error::InvalidRuleSet { .. }));

        let empty = MappingRuleSet::new("acme", RuleVersion(1), "US", vec![MappingRule::exact(" ", "X")]);
        assert_matches!(empty.validate(), Err(Error::InvalidRuleSet { .. }));
    }

    #[test]
    fn test_memory_reading_percent() {
        assert_eq!(MemoryReading::new(50, 200).usage_percent(), 25.0);
        assert_eq!(MemoryReading::new(50, 0).usage_percent(), 0.0);
    }

    #[test]
    fn test_rule_version_ordering() {
        assert!(RuleVersion(2) > RuleVersion(1));
        assert_eq!(RuleVersion(7).to_string(), "v7");
    }
}
