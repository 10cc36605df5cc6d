//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                             │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                    Ports (Traits)                         │  │
//! │  │  RuleStore │ ChangeFeed │ MarketSessionSource             │  │
//! │  │  MemoryProbe │ EventPublisher                             │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                      │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │ InMemoryRuleStore │ YamlRuleStore                         │  │
//! │  │ FixedSessionSource │ TradingHoursSessionSource            │  │
//! │  │ ProcMemoryProbe │ LoggingEventPublisher                   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use symbol_cache::adapters::{YamlRuleStore, ProcMemoryProbe};
//! use symbol_cache::domain::{ProviderId, RuleStore};
//!
//! let store = YamlRuleStore::new("./rules", Duration::from_secs(5));
//! let rules = store.load_rule_set(&ProviderId::from("acme")).await?;
//! ```

mod event_publisher;
mod file_store;
mod memory_store;
mod procfs;
mod session;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use file_store::YamlRuleStore;
pub use memory_store::InMemoryRuleStore;
pub use procfs::ProcMemoryProbe;
pub use session::{FixedSessionSource, TradingHours, TradingHoursSessionSource};
