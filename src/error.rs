//! Error types for the Symbol Mapping Cache Engine

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the symbol mapping cache engine.
///
/// The enum is `Clone` so that one deduplicated outcome can be delivered to
/// every caller awaiting it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // =========================================================================
    // Backing Store Errors
    // =========================================================================
    /// Rule load or change-feed connection failed
    #[error("Backing store unavailable: {reason}")]
    BackingStoreUnavailable { reason: String },

    /// The backing store has no rule set for this provider
    #[error("No mapping rule set for provider: {0}")]
    ProviderNotFound(String),

    /// A loaded rule set failed validation
    #[error("Invalid rule set for provider {provider}: {reason}")]
    InvalidRuleSet { provider: String, reason: String },

    // =========================================================================
    // Request Path Errors
    // =========================================================================
    /// Deduplicated work exceeded its timeout
    #[error("Query {key} timed out after {timeout:?}")]
    QueryTimeout { key: String, timeout: Duration },

    /// A batch digest could not be parsed
    #[error("Invalid batch digest: {0}")]
    InvalidDigest(String),

    /// Caller supplied a request that can never succeed
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Clearing every layer did not bring usage below the critical watermark
    #[error(
        "Memory usage {usage_percent:.1}% still at or above critical {critical_percent:.1}% after clearing all layers"
    )]
    MemoryPressureCleanupFailure {
        usage_percent: f64,
        critical_percent: f64,
    },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Document parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Shorthand for a backing-store failure
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Error::BackingStoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Errors worth retrying later (with backoff)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BackingStoreUnavailable { .. } | Error::QueryTimeout { .. } | Error::Io(_)
        )
    }

    /// Errors caused by the caller; rejected immediately, never retried
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Error::MalformedRequest(_) | Error::InvalidDigest(_))
    }
}
