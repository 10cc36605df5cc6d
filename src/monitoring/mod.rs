//! Runtime Monitoring
//!
//! Memory pressure handling and health reporting.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Runtime Monitoring                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────┐   ┌─────────────────────────────┐  │
//! │  │ Memory Watermark Monitor     │   │ Health Checks               │  │
//! │  │ (sample → L3 → L2 → L1)      │   │ (Liveness/Readiness/Parts)  │  │
//! │  └──────────────────────────────┘   └─────────────────────────────┘  │
//! │                 │                                  ▲                 │
//! │                 └────────── memory level ──────────┘                 │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

mod health;
mod memory;

pub use health::{ComponentHealth, HealthCheck, HealthCheckResult, HealthResponse, HealthStatus};
pub use memory::{
    CleanupReport, CleanupStep, MemoryLevel, MemoryMonitorConfig, MemorySample,
    MemoryWatermarkMonitor, MonitorOutcome,
};
