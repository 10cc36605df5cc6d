//! Symbol Mapping Cache Engine
//!
//! Translates market-data symbols between provider-native and
//! platform-standard formats, keeping provider rule sets, resolved symbols
//! and whole batch results in three bounded cache layers. Rule changes are
//! picked up from the rule store's change feed; memory pressure sheds
//! layers cheapest-first.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      SymbolMappingCache                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ L3 Batches   │───▶│ L2 Symbols   │───▶│ L1 Rules     │──▶ RuleStore
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          ▲                                      ▲               │
//! │  ┌───────┴──────────┐               ┌───────────┴──────┐        │
//! │  │ MemoryWatermark  │               │ ChangeFeed       │◀── ChangeFeed
//! │  │ Monitor          │               │ Watcher          │        │
//! │  └──────────────────┘               └──────────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Rule stores, session sources, memory probe, publishers
//! - [`cache`] - The three layers, TTL policy, deduplication, orchestrator
//! - [`config`] - CLI/environment settings and the typed engine config
//! - [`domain`] - Value objects, ports and domain events
//! - [`error`] - Error types
//! - [`feed`] - Change feed reconnect strategy and watcher
//! - [`mapping`] - Rule compilation and per-symbol outcomes
//! - [`monitoring`] - Memory watermark monitor and health checks

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod feed;
pub mod mapping;
pub mod monitoring;

// Re-export commonly used types
pub use cache::{BatchMappingResult, MapOptions, SymbolMappingCache};
pub use config::{EngineConfig, Settings};
pub use domain::{Direction, MappingRule, MappingRuleSet, ProviderId};
pub use error::{Error, Result};
pub use mapping::{MappingFailure, SymbolOutcome};
