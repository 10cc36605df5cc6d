//! Health Checks
//!
//! Liveness and readiness probes plus component checks for the cache engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::memory::MemoryLevel;
use crate::feed::WatcherState;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded but operational
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Check if status is healthy
    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    /// Rank used to pick the worst status of a response
    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Result of one component check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Component name (`cache`, `change_feed`, `memory`)
    pub name: String,
    /// Status
    pub status: HealthStatus,
    /// Why the component is not healthy
    pub message: Option<String>,
    /// Duration of check
    pub duration_ms: u64,
}

impl HealthCheckResult {
    /// Create a healthy result
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    /// Create a degraded result; the engine still serves mappings
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Create an unhealthy result
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Set duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status across all checks
    pub status: HealthStatus,
    /// Cache, change feed and memory check results
    pub checks: Vec<HealthCheckResult>,
    /// Crate version
    pub version: String,
    /// Seconds since the engine was built
    pub uptime_seconds: u64,
}

impl HealthResponse {
    /// Create a response from component checks
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max_by_key(HealthStatus::severity)
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }

    /// Look up one check by name
    pub fn check(&self, name: &str) -> Option<&HealthCheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

// =============================================================================
// Component Checks
// =============================================================================

/// Component state the engine reports into a health evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentHealth {
    pub cache_enabled: bool,
    /// `None` when no change feed is attached
    pub feed_state: Option<WatcherState>,
    /// `None` when no memory monitor is attached
    pub memory_level: Option<MemoryLevel>,
}

fn cache_check(enabled: bool) -> HealthCheckResult {
    if enabled {
        HealthCheckResult::healthy("cache")
    } else {
        HealthCheckResult::degraded("cache", "caching disabled, serving from backing store")
    }
}

fn feed_check(state: Option<WatcherState>) -> HealthCheckResult {
    match state {
        Some(WatcherState::Streaming) => HealthCheckResult::healthy("change_feed"),
        Some(state) => HealthCheckResult::degraded(
            "change_feed",
            format!("change feed {}, invalidations delayed", state),
        ),
        None => HealthCheckResult::degraded(
            "change_feed",
            "no change feed attached, entries expire by TTL only",
        ),
    }
}

fn memory_check(level: Option<MemoryLevel>) -> HealthCheckResult {
    match level {
        None => HealthCheckResult::healthy("memory"),
        Some(MemoryLevel::Normal) => HealthCheckResult::healthy("memory"),
        Some(MemoryLevel::Warning) => {
            HealthCheckResult::degraded("memory", "usage above warning watermark")
        }
        Some(MemoryLevel::Critical) => {
            HealthCheckResult::unhealthy("memory", "usage at or above critical watermark")
        }
        Some(MemoryLevel::Unknown) => HealthCheckResult::degraded("memory", "no memory sample"),
    }
}

// =============================================================================
// Health Check Manager
// =============================================================================

/// Health check manager
pub struct HealthCheck {
    /// Engine construction time
    start_time: Instant,
    /// Liveness flag
    live: AtomicBool,
    /// Set once the engine is built, cleared on shutdown
    ready: AtomicBool,
}

impl HealthCheck {
    /// Create a manager that is live but not yet ready
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Liveness result for `/healthz` and `/livez`
    pub fn liveness_check(&self) -> HealthCheckResult {
        if self.is_live() {
            HealthCheckResult::healthy("liveness")
        } else {
            HealthCheckResult::unhealthy("liveness", "Service shutting down")
        }
    }

    /// Readiness result, part of `/readyz`
    pub fn readiness_check(&self) -> HealthCheckResult {
        if self.is_ready() {
            HealthCheckResult::healthy("readiness")
        } else {
            HealthCheckResult::unhealthy("readiness", "Service not ready")
        }
    }

    /// Run all health checks against the given component state
    pub fn evaluate(&self, components: ComponentHealth) -> HealthResponse {
        let started = Instant::now();
        let checks = vec![
            self.liveness_check(),
            self.readiness_check(),
            cache_check(components.cache_enabled),
            feed_check(components.feed_state),
            memory_check(components.memory_level),
        ]
        .into_iter()
        .map(|c| c.with_duration(started.elapsed()))
        .collect();

        HealthResponse::new(checks, self.uptime())
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
