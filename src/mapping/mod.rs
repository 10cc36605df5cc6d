//! Symbol Mapping
//!
//! Rule compilation plus the per-symbol outcome types returned to callers.

mod compiled;

pub use compiled::{CompiledRuleSet, Resolution};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Why a single symbol could not be mapped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum MappingFailure {
    /// The provider's rule set has no rule for this symbol
    NoMatchingRule,
    /// The backing store has no rule set for the provider
    ProviderNotFound,
    /// The rule set could not be loaded
    BackingStoreUnavailable(String),
    /// The deduplicated load exceeded its timeout
    QueryTimeout,
    /// The provider's rule set failed validation
    InvalidRuleSet(String),
    /// Unexpected engine failure
    Internal(String),
}

impl MappingFailure {
    /// Transient failures are never cached
    pub fn is_transient(&self) -> bool {
        !matches!(self, MappingFailure::NoMatchingRule)
    }
}

impl From<&Error> for MappingFailure {
    fn from(err: &Error) -> Self {
        match err {
            Error::BackingStoreUnavailable { reason } => {
                MappingFailure::BackingStoreUnavailable(reason.clone())
            }
            Error::Io(e) => MappingFailure::BackingStoreUnavailable(e.to_string()),
            Error::ProviderNotFound(_) => MappingFailure::ProviderNotFound,
            Error::QueryTimeout { .. } => MappingFailure::QueryTimeout,
            Error::InvalidRuleSet { reason, .. } => MappingFailure::InvalidRuleSet(reason.clone()),
            Error::Parse(reason) => MappingFailure::InvalidRuleSet(reason.clone()),
            other => MappingFailure::Internal(other.to_string()),
        }
    }
}

impl std::fmt::Display for MappingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingFailure::NoMatchingRule => write!(f, "no matching rule"),
            MappingFailure::ProviderNotFound => write!(f, "provider not found"),
            MappingFailure::BackingStoreUnavailable(r) => {
                write!(f, "backing store unavailable: {}", r)
            }
            MappingFailure::QueryTimeout => write!(f, "query timeout"),
            MappingFailure::InvalidRuleSet(r) => write!(f, "invalid rule set: {}", r),
            MappingFailure::Internal(r) => write!(f, "internal error: {}", r),
        }
    }
}

/// Outcome for one input symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SymbolOutcome {
    Mapped { target: String },
    Failed { failure: MappingFailure },
}

impl SymbolOutcome {
    pub fn mapped(target: impl Into<String>) -> Self {
        SymbolOutcome::Mapped {
            target: target.into(),
        }
    }

    pub fn failed(failure: MappingFailure) -> Self {
        SymbolOutcome::Failed { failure }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, SymbolOutcome::Mapped { .. })
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            SymbolOutcome::Mapped { target } => Some(target),
            SymbolOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&MappingFailure> {
        match self {
            SymbolOutcome::Mapped { .. } => None,
            SymbolOutcome::Failed { failure } => Some(failure),
        }
    }

    /// Whether this outcome may be served from cache later
    pub fn is_cacheable(&self) -> bool {
        self.failure().map_or(true, |f| !f.is_transient())
    }
}
