//! Domain Layer
//!
//! Value objects, port traits and domain events of the symbol mapping cache.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the backing store, the
//!   change feed, market sessions and memory sampling
//! - **Events** (`events.rs`) - Domain events for observability and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use symbol_cache::domain::{ProviderId, RuleStore};
//!
//! async fn warm<S: RuleStore>(store: &S, provider: &ProviderId) -> Result<()> {
//!     let rules = store.load_rule_set(provider).await?;
//!     // ...
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::CacheEvent;
pub use ports::{
    // Port traits
    ChangeFeed,
    ChangeStream,
    EventPublisher,
    MarketSessionSource,
    MemoryProbe,
    RuleStore,
    Subscription,
    // Value objects
    ChangeEvent,
    ChangeOperation,
    Direction,
    MappingRule,
    MappingRuleSet,
    MarketSession,
    MemoryReading,
    ProviderId,
    ResumeToken,
    RuleVersion,
    WILDCARD,
};
